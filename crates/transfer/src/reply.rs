//! Result codes exchanged with the per-connection dispatcher.

/// What the dispatcher should do after an entry point returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpResult {
    /// Call [`on_send`](crate::TransferOp::on_send) again right away.
    Continue,
    /// Wait for a reply, subcommand result or overwrite decision.
    WouldBlock,
    Ok,
    /// Failed; a new attempt may succeed.
    Error,
    /// Failed; do not retry automatically.
    CriticalError,
    /// The caller broke the op's contract.
    SyntaxError,
    /// The backend cannot do this at all. Never retried.
    NotSupported,
    /// The op was driven out of order.
    InternalError,
}

impl OpResult {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OpResult::Continue | OpResult::WouldBlock)
    }

    /// Whether an automatic retry is pointless.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            OpResult::CriticalError
                | OpResult::SyntaxError
                | OpResult::NotSupported
                | OpResult::InternalError
        )
    }
}

/// One reply line to a command sent with
/// [`send_command`](crate::ProtocolSession::send_command).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReply {
    /// The session's verdict: positive completion for FTP, `OK` for SFTP.
    pub success: bool,
    /// Raw reply text, including any numeric code.
    pub line: String,
}

impl ServerReply {
    pub fn ok(line: impl Into<String>) -> Self {
        Self {
            success: true,
            line: line.into(),
        }
    }

    pub fn failed(line: impl Into<String>) -> Self {
        Self {
            success: false,
            line: line.into(),
        }
    }
}

/// Why a data transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferEndReason {
    #[default]
    None,
    Successful,
    Timeout,
    TransferFailure,
    /// The resume probe came back with the wrong data.
    FailedResumeTest,
    /// The transfer command itself was rejected.
    TransferCommandFailure,
    PreTransferCommandFailure,
    FailedTlsConnection,
}

/// Completion of a nested operation (cwd, listing, data transfer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubcommandOutcome {
    pub result: OpResult,
    pub end_reason: TransferEndReason,
}

impl SubcommandOutcome {
    pub fn ok() -> Self {
        Self {
            result: OpResult::Ok,
            end_reason: TransferEndReason::Successful,
        }
    }

    pub fn failed(end_reason: TransferEndReason) -> Self {
        Self {
            result: OpResult::Error,
            end_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_codes() {
        assert!(!OpResult::Continue.is_terminal());
        assert!(!OpResult::WouldBlock.is_terminal());
        for r in [
            OpResult::Ok,
            OpResult::Error,
            OpResult::CriticalError,
            OpResult::SyntaxError,
            OpResult::NotSupported,
            OpResult::InternalError,
        ] {
            assert!(r.is_terminal(), "{r:?}");
        }
    }

    #[test]
    fn only_plain_error_is_retryable() {
        assert!(!OpResult::Error.is_critical());
        assert!(OpResult::CriticalError.is_critical());
        assert!(OpResult::NotSupported.is_critical());
        assert!(!OpResult::Ok.is_critical());
    }
}
