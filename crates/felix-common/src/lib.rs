// Shared data types and small helpers used across crates.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("malformed broker address '{input}': {reason}")]
    MalformedAddress { input: String, reason: &'static str },
}

pub mod ids {
    // Strongly typed IDs to avoid mixing namespaces at compile time.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    macro_rules! id_type {
        ($name:ident) => {
            #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
            pub struct $name(Uuid);

            impl $name {
                // Generate a new random ID for this namespace.
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                // Wrap an existing UUID when decoding from storage.
                pub fn from_uuid(uuid: Uuid) -> Self {
                    Self(uuid)
                }

                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    let uuid =
                        Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(uuid))
                }
            }
        };
    }

    // A broker session is regenerated every time a broker (re)joins the cluster.
    id_type!(SessionId);
    // Store or partition session taken over from a failed broker.
    id_type!(StoreSessionId);
}

pub const DEFAULT_SCHEME: &str = "mq";
pub const DEFAULT_PORT: u16 = 7676;

/// Control-plane address of a broker: `scheme://host:port/`.
///
/// Scheme and port are optional on input (`mq` and 7676), host and scheme are
/// lowercased, so two spellings of the same endpoint compare equal.
///
/// ```
/// use felix_common::BrokerAddress;
///
/// let a: BrokerAddress = "Broker-A:1000".parse().expect("address");
/// let b: BrokerAddress = "mq://broker-a:1000/".parse().expect("address");
/// assert_eq!(a, b);
/// assert_eq!(a.to_string(), "mq://broker-a:1000/");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BrokerAddress {
    scheme: String,
    host: String,
    port: u16,
}

impl BrokerAddress {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let input = format!("{host}:{port}");
        let host = parse_host(host, &input)?;
        Ok(Self {
            scheme: DEFAULT_SCHEME.to_string(),
            host,
            port,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Key used when deduplicating address lists.
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}/", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}/", self.scheme, self.host, self.port)
        }
    }
}

impl FromStr for BrokerAddress {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let malformed = |reason| Error::MalformedAddress {
            input: input.to_string(),
            reason,
        };
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(malformed("empty address"));
        }

        let (scheme, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) => {
                if scheme.is_empty()
                    || !scheme
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
                {
                    return Err(malformed("invalid scheme"));
                }
                (scheme.to_ascii_lowercase(), rest)
            }
            None => (DEFAULT_SCHEME.to_string(), trimmed),
        };

        let rest = rest.strip_suffix('/').unwrap_or(rest);
        if rest.contains('/') {
            return Err(malformed("unexpected path"));
        }

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| malformed("unterminated ipv6 host"))?;
            if host.is_empty()
                || !host
                    .chars()
                    .all(|c| c.is_ascii_hexdigit() || matches!(c, ':' | '.'))
            {
                return Err(malformed("invalid ipv6 host"));
            }
            let port = match after {
                "" => None,
                other => Some(
                    other
                        .strip_prefix(':')
                        .ok_or_else(|| malformed("unexpected characters after host"))?,
                ),
            };
            (host.to_ascii_lowercase(), port)
        } else {
            match rest.split_once(':') {
                Some((host, port)) => (parse_host(host, input)?, Some(port)),
                None => (parse_host(rest, input)?, None),
            }
        };

        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| malformed("invalid port"))?,
            None => DEFAULT_PORT,
        };

        Ok(Self { scheme, host, port })
    }
}

fn parse_host(host: &str, input: &str) -> Result<String> {
    if host.is_empty()
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
    {
        return Err(Error::MalformedAddress {
            input: input.to_string(),
            reason: "invalid host",
        });
    }
    Ok(host.to_ascii_lowercase())
}

impl TryFrom<String> for BrokerAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BrokerAddress> for String {
    fn from(value: BrokerAddress) -> Self {
        value.to_string()
    }
}
