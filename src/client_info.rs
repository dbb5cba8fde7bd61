use crate::types::DeviceType;
use woothee::parser::{Parser, WootheeResult};

/// Device and network context attached to a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub device_type: Option<DeviceType>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
}

impl ClientInfo {
    /// Parse a user agent string. Empty or unrecognised agents yield no fields
    /// except the raw agent itself.
    pub fn from_user_agent(user_agent: Option<&str>) -> Self {
        let Some(ua) = user_agent.map(str::trim).filter(|ua| !ua.is_empty()) else {
            return Self::default();
        };

        let parser = Parser::new();
        let mut info = match parser.parse(ua) {
            Some(result) => Self::from_woothee_result(&result),
            None => Self::default(),
        };
        info.user_agent = Some(ua.to_string());
        info
    }

    /// Explicit client-supplied values take priority over parsed ones.
    pub fn with_overrides(
        mut self,
        device_type: Option<&str>,
        browser: Option<&str>,
        os: Option<&str>,
    ) -> Self {
        if let Some(device) = device_type.and_then(DeviceType::parse) {
            self.device_type = Some(device);
        }
        if let Some(browser) = clean_name(browser.unwrap_or("")) {
            self.browser = Some(browser);
        }
        if let Some(os) = clean_name(os.unwrap_or("")) {
            self.os = Some(os);
        }
        self
    }

    fn from_woothee_result(result: &WootheeResult) -> Self {
        Self {
            device_type: determine_device_type(result.category),
            browser: clean_name(result.name),
            os: clean_name(result.os),
            user_agent: None,
            ip: None,
        }
    }
}

fn clean_name(name: &str) -> Option<String> {
    let name = name.trim();
    if name.is_empty() || name == "UNKNOWN" {
        None
    } else {
        Some(name.to_string())
    }
}

fn determine_device_type(category: &str) -> Option<DeviceType> {
    match category {
        "pc" => Some(DeviceType::Desktop),
        "smartphone" | "mobilephone" => Some(DeviceType::Mobile),
        "tablet" => Some(DeviceType::Tablet),
        "crawler" => Some(DeviceType::Bot),
        "appliance" | "misc" => Some(DeviceType::Other),
        _ => None,
    }
}
