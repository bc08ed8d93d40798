/*
 * Scenario Suites
 *
 * System-level tests that drive the portable core's state machine the
 * way a running kernel would: the test body plays each thread in turn
 * (the scheduler decides who is "current" after every blocking call or
 * wake), and the assertions check the schedule the kernel would have
 * produced.
 *
 * Everything here touches the global singletons, so every test starts
 * with `test_sync::lock()` and re-initializes what it uses.
 */

mod donation;
mod userprog;
