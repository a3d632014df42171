use crate::{Error, Result};

/// Event header identity: package name plus optional `id` parameter.
///
/// Two NOTIFYs match a SUBSCRIBE iff both name and id agree. An `id=`
/// with an empty value normalises to no id, so `weather` and
/// `weather;id=` compare equal after parsing, comparison is the
/// (name, id) tuple and never the raw header text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventHeader {
    pub package: String,
    pub id: Option<String>,
}

impl EventHeader {
    pub fn new(package: &str, id: Option<&str>) -> Self {
        EventHeader {
            package: package.trim().to_string(),
            id: id.map(str::trim).filter(|v| !v.is_empty()).map(String::from),
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let mut parts = value.split(';');
        let package = parts.next().unwrap_or("").trim();
        if package.is_empty() || package.contains(char::is_whitespace) {
            return Err(Error::HeaderParseError(format!(
                "invalid Event header: {:?}",
                value
            )));
        }
        let mut id = None;
        for param in parts {
            if let Some((key, v)) = param.split_once('=') {
                if key.trim().eq_ignore_ascii_case("id") {
                    let v = v.trim();
                    if !v.is_empty() {
                        id = Some(v.to_string());
                    }
                }
            }
        }
        Ok(EventHeader {
            package: package.to_string(),
            id,
        })
    }
}

impl std::fmt::Display for EventHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{};id={}", self.package, id),
            None => write!(f, "{}", self.package),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubState {
    Active,
    Pending,
    Terminated,
    Unknown(String),
}

impl SubState {
    pub fn as_str(&self) -> &str {
        match self {
            SubState::Active => "active",
            SubState::Pending => "pending",
            SubState::Terminated => "terminated",
            SubState::Unknown(value) => value.as_str(),
        }
    }
}

/// Subscription-State header: state token plus the parameters RFC 6665
/// section 4.1.3 defines on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStateHeader {
    pub state: SubState,
    pub expires: Option<u32>,
    pub reason: Option<String>,
    pub retry_after: Option<u32>,
}

impl SubscriptionStateHeader {
    pub fn parse(value: &str) -> Result<Self> {
        let mut parts = value.split(';');
        let token = parts.next().unwrap_or("").trim();
        if token.is_empty() {
            return Err(Error::HeaderParseError(format!(
                "invalid Subscription-State header: {:?}",
                value
            )));
        }
        let state = match token.to_ascii_lowercase().as_str() {
            "active" => SubState::Active,
            "pending" => SubState::Pending,
            "terminated" => SubState::Terminated,
            _ => SubState::Unknown(token.to_string()),
        };

        let mut header = SubscriptionStateHeader {
            state,
            expires: None,
            reason: None,
            retry_after: None,
        };
        for param in parts {
            let Some((key, v)) = param.split_once('=') else {
                continue;
            };
            let v = v.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "expires" => header.expires = v.parse().ok(),
                "reason" => {
                    if !v.is_empty() {
                        header.reason = Some(v.to_string());
                    }
                }
                "retry-after" => header.retry_after = v.parse().ok(),
                _ => {}
            }
        }
        Ok(header)
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SubState::Terminated
    }
}

impl std::fmt::Display for SubscriptionStateHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.state.as_str())?;
        if let Some(expires) = self.expires {
            write!(f, ";expires={}", expires)?;
        }
        if let Some(reason) = &self.reason {
            write!(f, ";reason={}", reason)?;
        }
        if let Some(retry_after) = self.retry_after {
            write!(f, ";retry-after={}", retry_after)?;
        }
        Ok(())
    }
}
