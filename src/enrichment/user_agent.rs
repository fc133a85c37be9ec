//! User-agent parsing via woothee, with a fallback token scan for bots the
//! parser does not classify.

use woothee::parser::Parser;

/// Tokens that mark an agent as automated when woothee reports no crawler
/// category (monitoring agents, CLI fetchers, language HTTP clients).
const BOT_TOKENS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "slurp",
    "curl",
    "wget",
    "python-requests",
    "go-http-client",
    "httpclient",
    "monitor",
    "preview",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserAgentInfo {
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device: Option<String>,
    pub is_bot: bool,
    pub bot_name: Option<String>,
}

/// Parse a raw user-agent string into browser/OS/device plus bot flag.
pub fn parse_user_agent(ua: &str) -> UserAgentInfo {
    let parser = Parser::new();

    let Some(result) = parser.parse(ua) else {
        // Unparseable agents still get the token scan.
        if let Some(token) = matching_bot_token(ua) {
            return UserAgentInfo {
                is_bot: true,
                bot_name: Some(token.to_string()),
                ..Default::default()
            };
        }
        return UserAgentInfo::default();
    };

    let is_crawler = result.category == "crawler";
    let browser = non_unknown(result.name);
    let os = non_unknown(result.os);
    let device = device_class(result.category);

    if is_crawler {
        return UserAgentInfo {
            browser: None,
            os,
            device: None,
            is_bot: true,
            bot_name: browser,
        };
    }

    if let Some(token) = matching_bot_token(ua) {
        return UserAgentInfo {
            browser,
            os,
            device,
            is_bot: true,
            bot_name: Some(token.to_string()),
        };
    }

    UserAgentInfo {
        browser,
        os,
        device,
        is_bot: false,
        bot_name: None,
    }
}

fn non_unknown(value: &str) -> Option<String> {
    if value.is_empty() || value == "UNKNOWN" {
        None
    } else {
        Some(value.to_string())
    }
}

fn device_class(category: &str) -> Option<String> {
    match category {
        "pc" => Some("desktop".to_string()),
        "smartphone" | "mobilephone" => Some("mobile".to_string()),
        "appliance" => Some("appliance".to_string()),
        _ => None,
    }
}

fn matching_bot_token(ua: &str) -> Option<&'static str> {
    let lowered = ua.to_lowercase();
    BOT_TOKENS.iter().copied().find(|t| lowered.contains(t))
}
