use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(String),
    /// Non-success response. Displays the response body, which the server
    /// uses as its human-readable error.
    #[error("{}", status_message(.status, .body))]
    Status { status: u16, body: String },
    #[error("response decode failed: {0}")]
    Decode(String),
    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl ClientError {
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn status_message(status: &u16, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        format!("server returned HTTP {status}")
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_displays_response_body() {
        let err = ClientError::Status {
            status: 409,
            body: "execution already completed\n".to_string(),
        };
        assert_eq!(err.to_string(), "execution already completed");
        assert_eq!(err.status_code(), Some(409));

        let empty = ClientError::Status {
            status: 502,
            body: String::new(),
        };
        assert_eq!(empty.to_string(), "server returned HTTP 502");
        assert!(!empty.is_transport());
    }
}
