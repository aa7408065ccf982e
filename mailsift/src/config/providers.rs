//! Known IMAP provider presets
//!
//! Presets fill in host, port and folder when the config names a provider,
//! and let the provider be guessed from the account's e-mail domain.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderPreset {
    pub name: &'static str,
    pub display_name: &'static str,
    pub host: &'static str,
    pub port: u16,
    pub folder: &'static str,
    pub requires_app_password: bool,
}

const PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        name: "gmail",
        display_name: "Gmail",
        host: "imap.gmail.com",
        port: 993,
        folder: "INBOX",
        requires_app_password: true,
    },
    ProviderPreset {
        name: "outlook",
        display_name: "Outlook/Office 365",
        host: "outlook.office365.com",
        port: 993,
        folder: "INBOX",
        requires_app_password: false,
    },
    ProviderPreset {
        name: "yahoo",
        display_name: "Yahoo Mail",
        host: "imap.mail.yahoo.com",
        port: 993,
        folder: "INBOX",
        requires_app_password: true,
    },
    ProviderPreset {
        name: "aol",
        display_name: "AOL Mail",
        host: "imap.aol.com",
        port: 993,
        folder: "INBOX",
        requires_app_password: true,
    },
    ProviderPreset {
        name: "icloud",
        display_name: "iCloud Mail",
        host: "imap.mail.me.com",
        port: 993,
        folder: "INBOX",
        requires_app_password: true,
    },
    ProviderPreset {
        name: "fastmail",
        display_name: "Fastmail",
        host: "imap.fastmail.com",
        port: 993,
        folder: "INBOX",
        requires_app_password: false,
    },
    ProviderPreset {
        name: "tuta",
        display_name: "Tutanota",
        host: "mail.tutanota.com",
        port: 993,
        folder: "INBOX",
        requires_app_password: false,
    },
];

/// Preset by provider name. "custom" has no preset.
pub fn preset(name: &str) -> Option<&'static ProviderPreset> {
    let name = name.trim().to_lowercase();
    PRESETS.iter().find(|p| p.name == name)
}

pub fn supported_providers() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = PRESETS.iter().map(|p| p.name).collect();
    names.push("custom");
    names
}

/// Guess the provider from the domain of an e-mail address.
pub fn provider_for_email(email: &str) -> Option<&'static str> {
    let domain = email.rsplit_once('@')?.1.to_lowercase();

    if matches!(domain.as_str(), "gmail.com" | "googlemail.com") {
        return Some("gmail");
    }

    if matches!(
        domain.as_str(),
        "outlook.com"
            | "hotmail.com"
            | "live.com"
            | "msn.com"
            | "hotmail.co.uk"
            | "outlook.co.uk"
    ) {
        return Some("outlook");
    }

    if matches!(
        domain.as_str(),
        "yahoo.com" | "yahoo.co.uk" | "ymail.com" | "rocketmail.com"
    ) {
        return Some("yahoo");
    }

    if domain == "aol.com" {
        return Some("aol");
    }

    if matches!(domain.as_str(), "icloud.com" | "me.com" | "mac.com") {
        return Some("icloud");
    }

    if matches!(domain.as_str(), "fastmail.com" | "fastmail.fm") {
        return Some("fastmail");
    }

    if matches!(
        domain.as_str(),
        "tutanota.com" | "tutanota.de" | "tuta.io" | "tuta.com" | "keemail.me"
    ) {
        return Some("tuta");
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_lookup_is_case_insensitive() {
        assert_eq!(preset("Gmail").unwrap().host, "imap.gmail.com");
        assert!(preset("custom").is_none());
        assert!(preset("protonmail").is_none());
    }

    #[test]
    fn test_provider_for_email() {
        assert_eq!(provider_for_email("a@me.com"), Some("icloud"));
        assert_eq!(provider_for_email("a@Hotmail.com"), Some("outlook"));
        assert_eq!(provider_for_email("a@example.org"), None);
        assert_eq!(provider_for_email("not-an-address"), None);
    }

    #[test]
    fn test_supported_includes_custom() {
        let names = supported_providers();
        assert!(names.contains(&"custom"));
        assert!(names.contains(&"tuta"));
    }
}
