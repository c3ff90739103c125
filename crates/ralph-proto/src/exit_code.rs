//! The fixed exit-code enum for `ralph run`.

/// Process exit codes for the task loop. `ralph verify` has its own
/// narrower set (see `ralph_core::verify::VerifyExitCode`) since it
/// exercises a different subset of failure modes; the numeric values
/// are kept aligned where both entry points can hit the same cause
/// (config errors, gate failures, service failures) so a caller
/// scripting around `ralph` doesn't have to special-case which
/// subcommand produced a given code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    ConfigError = 1,
    TaskSourceError = 2,
    TaskExecutionFailed = 3,
    GateFailure = 4,
    PostVerificationFailed = 5,
    ChecksumTampering = 6,
    UserAbort = 7,
    AgentError = 8,
    ServiceFailure = 9,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.as_i32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_zero() {
        assert_eq!(ExitCode::Success.as_i32(), 0);
    }

    #[test]
    fn matches_spec_enumeration() {
        assert_eq!(ExitCode::ConfigError.as_i32(), 1);
        assert_eq!(ExitCode::TaskSourceError.as_i32(), 2);
        assert_eq!(ExitCode::TaskExecutionFailed.as_i32(), 3);
        assert_eq!(ExitCode::GateFailure.as_i32(), 4);
        assert_eq!(ExitCode::PostVerificationFailed.as_i32(), 5);
        assert_eq!(ExitCode::ChecksumTampering.as_i32(), 6);
        assert_eq!(ExitCode::UserAbort.as_i32(), 7);
        assert_eq!(ExitCode::AgentError.as_i32(), 8);
        assert_eq!(ExitCode::ServiceFailure.as_i32(), 9);
    }
}
