//! Production code waits on events, never on wall-clock polling

use architectural_enforcement::{
    find_blocking_in_async, find_sleep_calls, production_sources, scan, workspace_root,
};

fn report(violations: &[architectural_enforcement::Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn sources_are_found() {
    let sources = production_sources(&workspace_root());
    assert!(
        sources.iter().any(|p| p.ends_with("routing/router.rs")),
        "scanner did not find the router sources"
    );
}

#[test]
fn no_sleep_in_production_code() {
    let violations = scan(&workspace_root(), find_sleep_calls);
    assert!(
        violations.is_empty(),
        "sleep calls found, use Notify/interval/timeout instead:\n{}",
        report(&violations)
    );
}

#[test]
fn no_blocking_io_in_async_functions() {
    let violations = scan(&workspace_root(), find_blocking_in_async);
    assert!(
        violations.is_empty(),
        "blocking I/O inside async fn:\n{}",
        report(&violations)
    );
}
