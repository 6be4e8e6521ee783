//! Control protocol between backends and the balancer.
//!
//! Messages are newline-delimited ASCII lines of space-separated tokens,
//! carried over a TCP control connection. The one exception is the sanity
//! probe, which the balancer sends over the data path (the backend's
//! forwarder) so that a successful echo proves packets actually reach the
//! backend.
//!
//! ```text
//! backend                          balancer
//!    | REGISTER <name> <ip>          |
//!    |------------------------------>|
//!    |       SANITY <nonce>  (data)  |
//!    |<- - - - - - - - - - - - - - - |
//!    | SANE <nonce>                  |
//!    |------------------------------>|
//!    |        REGISTERED <name> <ip> |
//!    |<------------------------------|
//!    | HEALTH 200                    |
//!    |------------------------------>|
//!    |                 HEALTHACK 200 |
//!    |<------------------------------|
//! ```

use std::fmt;
use std::net::IpAddr;

use rand::Rng;
use thiserror::Error;

/// Default TCP port for the control channel.
pub const DEFAULT_CONTROL_PORT: u16 = 1338;

/// Default UDP port backends receive forwarded packets on.
pub const DEFAULT_DATA_PORT: u16 = 1337;

/// Status code carried by health acknowledgements.
pub const HEALTH_OK: u16 = 200;

/// Length of the sanity-check nonce.
pub const NONCE_LEN: usize = 16;

const SANITY_PREFIX: &str = "SANITY ";

/// Protocol decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// Line held no tokens.
    #[error("empty message")]
    Empty,

    /// Known command with missing or extra arguments.
    #[error("malformed {command}: {reason}")]
    Malformed {
        command: &'static str,
        reason: String,
    },

    /// Address token did not parse as an IP address.
    #[error("ip not parseable: {0}")]
    InvalidAddress(String),

    /// Name was empty once disallowed characters were stripped.
    #[error("invalid backend name: {0:?}")]
    InvalidName(String),
}

/// Messages sent by a backend over the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register { name: String, address: IpAddr },
    Sane { nonce: String },
    Health { code: String },
    Pause,
    Resume,
    Deregister,
    /// Unrecognized first token.
    Unknown(String),
}

impl Request {
    /// Decode a single control line.
    ///
    /// The backend name in `REGISTER` is sanitized as part of decoding.
    pub fn decode(line: &str) -> Result<Self, ProtoError> {
        let mut tokens = line.split_whitespace();
        let command = tokens.next().ok_or(ProtoError::Empty)?;

        match command {
            "REGISTER" => {
                let (Some(raw_name), Some(raw_addr)) = (tokens.next(), tokens.next()) else {
                    return Err(ProtoError::Malformed {
                        command: "REGISTER",
                        reason: "expected REGISTER <name> <ip>".to_string(),
                    });
                };

                let name = sanitize_name(raw_name);
                if name.is_empty() {
                    return Err(ProtoError::InvalidName(raw_name.to_string()));
                }

                let address = raw_addr
                    .parse::<IpAddr>()
                    .map_err(|_| ProtoError::InvalidAddress(raw_addr.to_string()))?;

                Ok(Self::Register { name, address })
            }
            "SANE" => match tokens.next() {
                Some(nonce) => Ok(Self::Sane {
                    nonce: nonce.to_string(),
                }),
                None => Err(ProtoError::Malformed {
                    command: "SANE",
                    reason: "missing nonce".to_string(),
                }),
            },
            "HEALTH" => match tokens.next() {
                Some(code) => Ok(Self::Health {
                    code: code.to_string(),
                }),
                None => Err(ProtoError::Malformed {
                    command: "HEALTH",
                    reason: "no status code in health check".to_string(),
                }),
            },
            "PAUSE" => Ok(Self::Pause),
            "RESUME" => Ok(Self::Resume),
            "DEREGISTER" => Ok(Self::Deregister),
            other => Ok(Self::Unknown(other.to_string())),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { name, address } => write!(f, "REGISTER {} {}", name, address),
            Self::Sane { nonce } => write!(f, "SANE {}", nonce),
            Self::Health { code } => write!(f, "HEALTH {}", code),
            Self::Pause => f.write_str("PAUSE"),
            Self::Resume => f.write_str("RESUME"),
            Self::Deregister => f.write_str("DEREGISTER"),
            Self::Unknown(token) => f.write_str(token),
        }
    }
}

/// Messages sent by the balancer over the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Registered { name: String, address: IpAddr },
    Invalid(String),
    Paused(String),
    Resumed(String),
    HealthAck(u16),
    Deregistered { name: String, reason: String },
}

impl Reply {
    /// Decode a balancer reply line.
    pub fn decode(line: &str) -> Result<Self, ProtoError> {
        let line = line.trim();
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            "" => Err(ProtoError::Empty),
            "REGISTERED" => {
                let mut tokens = rest.split_whitespace();
                let (Some(name), Some(addr)) = (tokens.next(), tokens.next()) else {
                    return Err(ProtoError::Malformed {
                        command: "REGISTERED",
                        reason: "expected REGISTERED <name> <ip>".to_string(),
                    });
                };
                let address = addr
                    .parse()
                    .map_err(|_| ProtoError::InvalidAddress(addr.to_string()))?;
                Ok(Self::Registered {
                    name: name.to_string(),
                    address,
                })
            }
            "INVALID" => Ok(Self::Invalid(rest.to_string())),
            "PAUSED" => Ok(Self::Paused(single_token("PAUSED", rest)?)),
            "RESUMED" => Ok(Self::Resumed(single_token("RESUMED", rest)?)),
            "HEALTHACK" => rest
                .parse()
                .map(Self::HealthAck)
                .map_err(|_| ProtoError::Malformed {
                    command: "HEALTHACK",
                    reason: format!("status code {:?} is not numeric", rest),
                }),
            "DEREGISTERED" => {
                let (name, reason) = rest.split_once(' ').unwrap_or((rest, ""));
                if name.is_empty() {
                    return Err(ProtoError::Malformed {
                        command: "DEREGISTERED",
                        reason: "missing backend name".to_string(),
                    });
                }
                Ok(Self::Deregistered {
                    name: name.to_string(),
                    reason: reason.trim().to_string(),
                })
            }
            other => Err(ProtoError::Malformed {
                command: "reply",
                reason: format!("unknown reply {:?}", other),
            }),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered { name, address } => write!(f, "REGISTERED {} {}", name, address),
            Self::Invalid(reason) => write!(f, "INVALID {}", reason),
            Self::Paused(name) => write!(f, "PAUSED {}", name),
            Self::Resumed(name) => write!(f, "RESUMED {}", name),
            Self::HealthAck(code) => write!(f, "HEALTHACK {}", code),
            Self::Deregistered { name, reason } => write!(f, "DEREGISTERED {} {}", name, reason),
        }
    }
}

fn single_token(command: &'static str, rest: &str) -> Result<String, ProtoError> {
    match rest.split_whitespace().next() {
        Some(token) => Ok(token.to_string()),
        None => Err(ProtoError::Malformed {
            command,
            reason: "missing backend name".to_string(),
        }),
    }
}

/// Strip every character outside `[A-Za-z0-9-_.]`.
///
/// Names are echoed back in replies, so anything that could split a line
/// or a token must not survive.
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect()
}

/// Generate a random uppercase nonce for the sanity probe.
pub fn generate_nonce() -> String {
    let mut rng = rand::rng();
    (0..NONCE_LEN)
        .map(|_| char::from(rng.random_range(b'A'..=b'Z')))
        .collect()
}

/// Encode the data-path sanity probe.
pub fn encode_sanity_probe(nonce: &str) -> Vec<u8> {
    format!("{}{}", SANITY_PREFIX, nonce).into_bytes()
}

/// Extract the nonce from a data-path datagram, if it is a sanity probe.
pub fn parse_sanity_probe(datagram: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(datagram).ok()?;
    let nonce = text.strip_prefix(SANITY_PREFIX)?.trim();
    if nonce.is_empty() || nonce.contains(' ') {
        return None;
    }
    Some(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("REGISTER b1 10.0.0.2", "b1", "10.0.0.2")]
    #[case("REGISTER  web-01.eu   10.0.0.3 \r\n", "web-01.eu", "10.0.0.3")]
    #[case("REGISTER b$1;x fd00::7", "b1x", "fd00::7")]
    fn test_decode_register(#[case] line: &str, #[case] name: &str, #[case] addr: &str) {
        assert_eq!(
            Request::decode(line).unwrap(),
            Request::Register {
                name: name.to_string(),
                address: addr.parse().unwrap(),
            }
        );
    }

    #[rstest]
    #[case("REGISTER b1")]
    #[case("REGISTER")]
    fn test_decode_register_missing_fields(#[case] line: &str) {
        assert!(matches!(
            Request::decode(line),
            Err(ProtoError::Malformed {
                command: "REGISTER",
                ..
            })
        ));
    }

    #[test]
    fn test_decode_register_bad_address() {
        assert_eq!(
            Request::decode("REGISTER b1 10.0.0.300").unwrap_err(),
            ProtoError::InvalidAddress("10.0.0.300".to_string())
        );
    }

    #[test]
    fn test_decode_register_name_sanitized_to_nothing() {
        assert_eq!(
            Request::decode("REGISTER $$$ 10.0.0.2").unwrap_err(),
            ProtoError::InvalidName("$$$".to_string())
        );
    }

    #[rstest]
    #[case("PAUSE", Request::Pause)]
    #[case("RESUME\n", Request::Resume)]
    #[case("DEREGISTER", Request::Deregister)]
    #[case("HEALTH 200", Request::Health { code: "200".to_string() })]
    #[case("SANE ABCDEFGH", Request::Sane { nonce: "ABCDEFGH".to_string() })]
    #[case("JUMP high", Request::Unknown("JUMP".to_string()))]
    #[case("pause", Request::Unknown("pause".to_string()))]
    fn test_decode_requests(#[case] line: &str, #[case] expected: Request) {
        assert_eq!(Request::decode(line).unwrap(), expected);
    }

    #[test]
    fn test_decode_empty_and_incomplete() {
        assert_eq!(Request::decode("  \n").unwrap_err(), ProtoError::Empty);
        assert!(matches!(
            Request::decode("HEALTH"),
            Err(ProtoError::Malformed {
                command: "HEALTH",
                ..
            })
        ));
        assert!(matches!(
            Request::decode("SANE"),
            Err(ProtoError::Malformed { command: "SANE", .. })
        ));
    }

    #[test]
    fn test_reply_wire_format() {
        let reply = Reply::Registered {
            name: "b1".to_string(),
            address: "10.0.0.2".parse().unwrap(),
        };
        assert_eq!(reply.to_string(), "REGISTERED b1 10.0.0.2");
        assert_eq!(Reply::HealthAck(HEALTH_OK).to_string(), "HEALTHACK 200");
        assert_eq!(
            Reply::Deregistered {
                name: "b1".to_string(),
                reason: "client requested deregistration".to_string(),
            }
            .to_string(),
            "DEREGISTERED b1 client requested deregistration"
        );
    }

    #[rstest]
    #[case("REGISTERED b1 10.0.0.2\n", Reply::Registered { name: "b1".to_string(), address: "10.0.0.2".parse().unwrap() })]
    #[case("INVALID backend already paused", Reply::Invalid("backend already paused".to_string()))]
    #[case("PAUSED b1", Reply::Paused("b1".to_string()))]
    #[case("RESUMED b1", Reply::Resumed("b1".to_string()))]
    #[case("HEALTHACK 200", Reply::HealthAck(200))]
    #[case(
        "DEREGISTERED b1 health check timeout ran out",
        Reply::Deregistered { name: "b1".to_string(), reason: "health check timeout ran out".to_string() }
    )]
    fn test_decode_replies(#[case] line: &str, #[case] expected: Reply) {
        assert_eq!(Reply::decode(line).unwrap(), expected);
    }

    #[test]
    fn test_decode_reply_errors() {
        assert_eq!(Reply::decode("").unwrap_err(), ProtoError::Empty);
        assert!(Reply::decode("HEALTHACK ok").is_err());
        assert!(Reply::decode("HELLO").is_err());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("web-01_a.b"), "web-01_a.b");
        assert_eq!(sanitize_name("evil\nREGISTERED x"), "evilREGISTEREDx");
        assert_eq!(sanitize_name("名前"), "");
    }

    #[test]
    fn test_nonce_shape() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), NONCE_LEN);
        assert!(nonce.bytes().all(|b| b.is_ascii_uppercase()));
        assert_ne!(nonce, generate_nonce());
    }

    #[test]
    fn test_sanity_probe() {
        let probe = encode_sanity_probe("QWERTYUIOPASDFGH");
        assert_eq!(probe, b"SANITY QWERTYUIOPASDFGH");
        assert_eq!(parse_sanity_probe(&probe), Some("QWERTYUIOPASDFGH"));
        assert_eq!(parse_sanity_probe(b"SANITY "), None);
        assert_eq!(parse_sanity_probe(&[0x45, 0x00, 0x00, 0x1c]), None);
    }
}
