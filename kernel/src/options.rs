/*
 * Boot Options
 *
 * The loader hands the kernel one command line. Options start with '-';
 * the first non-option token begins an action, of which `run CMD` is the
 * one this kernel knows: CMD (the rest of the line) is the command for
 * the initial user process, program name plus arguments.
 */

use alloc::string::String;

use log::LevelFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootOptions {
    /// Use the advanced (BSD-style) scheduler instead of priority
    /// donation scheduling.
    pub mlfqs: bool,
    /// Log verbosity.
    pub log_level: LevelFilter,
    /// Command line of the initial user process.
    pub run: Option<String>,
}

impl Default for BootOptions {
    fn default() -> Self {
        BootOptions { mlfqs: false, log_level: LevelFilter::Info, run: None }
    }
}

impl BootOptions {
    /// Parse a kernel command line. Unknown options are ignored with a
    /// warning rather than halting the boot.
    pub fn parse(cmdline: &str) -> BootOptions {
        let mut opts = BootOptions::default();
        let mut tokens = cmdline.split_whitespace();

        while let Some(tok) = tokens.next() {
            match tok {
                "-mlfqs" => opts.mlfqs = true,
                "-q" => opts.log_level = LevelFilter::Warn,
                "-v" => opts.log_level = LevelFilter::Debug,
                "run" => {
                    let rest: alloc::vec::Vec<&str> = tokens.collect();
                    if !rest.is_empty() {
                        opts.run = Some(rest.join(" "));
                    }
                    break;
                }
                other => log::warn!("unknown boot option '{}'", other),
            }
        }
        opts
    }

    /// Name for the scheduler mode, for the boot banner.
    pub fn scheduler_name(&self) -> &'static str {
        if self.mlfqs { "mlfqs" } else { "priority" }
    }
}

impl core::fmt::Display for BootOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "scheduler={}", self.scheduler_name())?;
        if let Some(run) = &self.run {
            write!(f, " run='{}'", run)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = BootOptions::parse("");
        assert!(!opts.mlfqs);
        assert_eq!(opts.run, None);
    }

    #[test]
    fn mlfqs_flag() {
        let opts = BootOptions::parse("-mlfqs");
        assert!(opts.mlfqs);
        assert_eq!(opts.scheduler_name(), "mlfqs");
    }

    #[test]
    fn run_takes_the_rest_of_the_line() {
        let opts = BootOptions::parse("-mlfqs run echo hello world");
        assert!(opts.mlfqs);
        assert_eq!(opts.run.as_deref(), Some("echo hello world"));
    }

    #[test]
    fn run_without_command_is_none() {
        let opts = BootOptions::parse("run");
        assert_eq!(opts.run, None);
    }
}
