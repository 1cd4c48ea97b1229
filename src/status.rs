/// Checks whether a build life-cycle status is terminal, i.e. no further
/// log activity is expected once it has been observed.
///
/// Unknown statuses are treated as non-terminal so that polling keeps
/// going rather than cutting a live build short.
pub fn is_terminal_status(status: &str) -> bool {
    matches!(
        status,
        "success"
            | "build_failure"
            | "init_failure"
            | "ready"
            | "failure"
            | "cancelled"
            | "init_timeout"
    )
}
