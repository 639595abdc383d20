//! User-Agent parsing for session device fingerprints.
//!
//! Extracts browser, OS and device family from the raw header without
//! an external parser dependency. Unrecognized families come back as
//! `"Other"` so stored records always have a value to display.

use crate::records::DeviceInfo;

const OTHER: &str = "Other";

/// Parse a User-Agent header into a [`DeviceInfo`].
///
/// An empty or unrecognized header yields `"Other"` families with all
/// class flags unset; this never fails.
#[must_use]
pub fn parse_user_agent(user_agent: &str) -> DeviceInfo {
    if user_agent.trim().is_empty() {
        return DeviceInfo {
            browser: OTHER.to_string(),
            browser_version: String::new(),
            os: OTHER.to_string(),
            device: OTHER.to_string(),
            ..DeviceInfo::default()
        };
    }

    let (browser, browser_version) = detect_browser(user_agent);
    let os = detect_os(user_agent);
    let device = detect_device(user_agent);
    let (is_mobile, is_tablet) = classify(user_agent);
    // A recognized desktop OS without any mobile/tablet signal is a PC.
    let is_pc = !is_mobile
        && !is_tablet
        && matches!(os.as_str(), "Windows" | "macOS" | "Linux" | "Chrome OS");

    DeviceInfo {
        browser,
        browser_version,
        os,
        device,
        is_mobile,
        is_tablet,
        is_pc,
    }
}

/// Browser family and version. Order matters: Chromium derivatives
/// advertise `Chrome/` and `Safari/`, so the more specific markers
/// are checked first.
fn detect_browser(ua: &str) -> (String, String) {
    if ua.contains("Edg/") || ua.contains("Edge/") {
        let version = version_after(ua, "Edg/").or_else(|| version_after(ua, "Edge/"));
        return ("Edge".to_string(), version.unwrap_or_default());
    }
    if ua.contains("OPR/") || ua.contains("Opera/") {
        let version = version_after(ua, "OPR/").or_else(|| version_after(ua, "Opera/"));
        return ("Opera".to_string(), version.unwrap_or_default());
    }
    if ua.contains("Firefox/") {
        let version = version_after(ua, "Firefox/");
        return ("Firefox".to_string(), version.unwrap_or_default());
    }
    if ua.contains("Chrome/") && !ua.contains("Chromium") {
        let kind = if ua.contains("Mobile") {
            "Chrome Mobile"
        } else {
            "Chrome"
        };
        let version = version_after(ua, "Chrome/");
        return (kind.to_string(), version.unwrap_or_default());
    }
    if ua.contains("Safari/") && !ua.contains("Chrome") && !ua.contains("Chromium") {
        let kind = if ua.contains("Mobile") {
            "Mobile Safari"
        } else {
            "Safari"
        };
        // Safari carries its real version under "Version/".
        let version = version_after(ua, "Version/");
        return (kind.to_string(), version.unwrap_or_default());
    }
    if ua.contains("MSIE ") || ua.contains("Trident/") {
        let version = version_after(ua, "MSIE ")
            .or_else(|| ua.contains("Trident/7.0").then(|| "11".to_string()));
        return ("IE".to_string(), version.unwrap_or_default());
    }
    (OTHER.to_string(), String::new())
}

/// Operating system family. iOS is checked before macOS because iOS
/// headers also contain "like Mac OS X".
fn detect_os(ua: &str) -> String {
    if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iPod") {
        "iOS".to_string()
    } else if ua.contains("Windows Phone") {
        "Windows Phone".to_string()
    } else if ua.contains("Windows") {
        "Windows".to_string()
    } else if ua.contains("Macintosh") || ua.contains("Mac OS X") {
        "macOS".to_string()
    } else if ua.contains("Android") {
        "Android".to_string()
    } else if ua.contains("CrOS") {
        "Chrome OS".to_string()
    } else if ua.contains("Linux") {
        "Linux".to_string()
    } else {
        OTHER.to_string()
    }
}

/// Hardware family, best effort. Desktop headers do not name the
/// machine, so anything non-Apple and non-Android falls to "Other".
fn detect_device(ua: &str) -> String {
    if ua.contains("iPhone") {
        "iPhone".to_string()
    } else if ua.contains("iPad") {
        "iPad".to_string()
    } else if ua.contains("iPod") {
        "iPod".to_string()
    } else if ua.contains("Macintosh") {
        "Mac".to_string()
    } else if ua.contains("Android") {
        // "Linux; Android 13; SM-G991B) ..." carries the model last
        // in the parenthesized platform block.
        extract_android_model(ua).unwrap_or_else(|| "Android Device".to_string())
    } else {
        OTHER.to_string()
    }
}

/// Mobile/tablet classification. iPads and Android builds without the
/// "Mobile" token are tablets; everything else with a phone marker is
/// mobile.
fn classify(ua: &str) -> (bool, bool) {
    let is_tablet =
        ua.contains("iPad") || (ua.contains("Android") && !ua.contains("Mobile"));
    if is_tablet {
        return (false, true);
    }
    let is_mobile = ua.contains("Mobile")
        || ua.contains("iPhone")
        || ua.contains("iPod")
        || ua.contains("Android")
        || ua.contains("Windows Phone")
        || ua.contains("BlackBerry");
    (is_mobile, false)
}

/// Dotted version number immediately following `prefix`, if present.
fn version_after(ua: &str, prefix: &str) -> Option<String> {
    let start = ua.find(prefix)? + prefix.len();
    let rest = &ua[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(rest.len());
    let version = &rest[..end];
    (!version.is_empty()).then(|| version.to_string())
}

/// Device model from the platform block of an Android header.
fn extract_android_model(ua: &str) -> Option<String> {
    let open = ua.find('(')?;
    let close = ua[open..].find(')')? + open;
    let last = ua[open + 1..close].split(';').next_back()?.trim();
    if last.is_empty() || last.starts_with("Android") || last.starts_with("Linux") {
        return None;
    }
    // Strip a trailing build tag like "SM-G991B Build/TP1A".
    let model = last.split(" Build/").next().unwrap_or(last).trim();
    (!model.is_empty()).then(|| model.to_string())
}
