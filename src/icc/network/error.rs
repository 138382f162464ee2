use std::fmt;

/// Failure of a kernel-facing networking operation
#[derive(Debug)]
pub enum NetworkError {
    Netlink(rtnetlink::Error),
    Io(std::io::Error),
    /// External tool (iptables, sysctl) exited non-zero
    Command { cmd: String, stderr: String },
    Validation(String),
    Timeout(String),
    /// Interface or namespace missing
    NotFound(String),
    Namespace(String),
}

impl NetworkError {
    /// True when the error means the target object is already gone.
    ///
    /// Deletions treat this as success.
    pub fn is_not_found(&self) -> bool {
        match self {
            NetworkError::NotFound(_) => true,
            NetworkError::Netlink(e) => e.to_string().contains("No such device"),
            NetworkError::Command { stderr, .. } => {
                stderr.contains("Cannot find device") || stderr.contains("No such device")
            }
            _ => false,
        }
    }

    /// True when the kernel reported EEXIST (route or address already present)
    pub fn is_already_exists(&self) -> bool {
        match self {
            NetworkError::Netlink(e) => e.to_string().contains("File exists"),
            NetworkError::Command { stderr, .. } => stderr.contains("File exists"),
            _ => false,
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Netlink(e) => write!(f, "netlink error: {}", e),
            NetworkError::Io(e) => write!(f, "io error: {}", e),
            NetworkError::Command { cmd, stderr } => {
                write!(f, "command '{}' failed: {}", cmd, stderr.trim())
            }
            NetworkError::Validation(msg) => write!(f, "validation error: {}", msg),
            NetworkError::Timeout(msg) => write!(f, "timeout: {}", msg),
            NetworkError::NotFound(msg) => write!(f, "not found: {}", msg),
            NetworkError::Namespace(msg) => write!(f, "namespace error: {}", msg),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetworkError::Netlink(e) => Some(e),
            NetworkError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rtnetlink::Error> for NetworkError {
    fn from(e: rtnetlink::Error) -> Self {
        NetworkError::Netlink(e)
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        NetworkError::Io(e)
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_recognised() {
        assert!(NetworkError::NotFound("vethb-h3".into()).is_not_found());
        assert!(!NetworkError::Validation("x".into()).is_not_found());
    }

    #[test]
    fn command_display_includes_context() {
        let err = NetworkError::Command {
            cmd: "iptables -t nat -A OUTPUT".into(),
            stderr: "Permission denied\n".into(),
        };
        assert_eq!(
            err.to_string(),
            "command 'iptables -t nat -A OUTPUT' failed: Permission denied"
        );
        assert!(NetworkError::Command { cmd: "ip".into(), stderr: "RTNETLINK answers: File exists".into() }
            .is_already_exists());
    }
}
