//! Scrubbing for free-text error messages before they reach a client or a
//! persisted log row. URLs keep their scheme and TLD tail, path segments and
//! query values are collapsed, bare domains and IPv4 addresses are hidden,
//! and email local parts are dropped.

use std::sync::OnceLock;

use regex::Regex;

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:http|https)://[^\s/$.?#][^\s]*").expect("url pattern"))
}

fn email_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@([A-Za-z0-9.-]+\.[A-Za-z]{2,})").expect("email pattern")
    })
}

fn domain_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,}\b")
            .expect("domain pattern")
    })
}

fn ipv4_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("ipv4 pattern"))
}

/// Tail parts of a host worth preserving: two parts for likely country-code
/// TLDs (co.uk, com.cn), otherwise just the TLD.
fn host_tail(parts: &[&str]) -> Vec<String> {
    if parts.len() < 2 {
        return parts.iter().map(|p| p.to_string()).collect();
    }
    let last = parts[parts.len() - 1];
    let second_last = parts[parts.len() - 2];
    if last.len() == 2 && second_last.len() <= 3 {
        vec![second_last.to_string(), last.to_string()]
    } else {
        vec![last.to_string()]
    }
}

/// api.openai.com -> ***.com, sub.domain.co.uk -> ***.co.uk
fn mask_host_for_url(host: &str) -> String {
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() < 2 {
        return "***".to_string();
    }
    format!("***.{}", host_tail(&parts).join("."))
}

/// openai.com -> ***.com, api.openai.com -> ***.***.com
fn mask_plain_domain(domain: &str) -> String {
    let parts: Vec<&str> = domain.split('.').collect();
    if parts.len() < 2 {
        return domain.to_string();
    }
    let tail = host_tail(&parts);
    let stars = parts.len().saturating_sub(tail.len()).max(1);
    let mut out = vec!["***".to_string(); stars];
    out.extend(tail);
    out.join(".")
}

fn mask_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let (authority, tail) = match rest.find(['/', '?']) {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    if authority.is_empty() {
        return url.to_string();
    }
    let mut out = format!("{scheme}://{}", mask_host_for_url(authority));

    let (path, query) = match tail.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (tail, None),
    };
    if path == "/" {
        out.push('/');
    } else if !path.is_empty() {
        let masked: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|seg| !seg.is_empty())
            .map(|_| "***")
            .collect();
        if !masked.is_empty() {
            out.push('/');
            out.push_str(&masked.join("/"));
        }
    }
    if let Some(query) = query {
        let masked: Vec<String> = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, _)) => format!("{key}=***"),
                None => format!("{pair}=***"),
            })
            .collect();
        if masked.is_empty() {
            out.push_str("?***");
        } else {
            out.push('?');
            out.push_str(&masked.join("&"));
        }
    }
    out
}

/// Hide the local part of an email, keeping the domain for context.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((_, domain)) if !domain.is_empty() => format!("***@{domain}"),
        _ => "***masked***".to_string(),
    }
}

/// Mask URLs, bare domains, IPv4 addresses, and email local parts in a
/// free-text message.
pub fn mask_sensitive_info(text: &str) -> String {
    let masked = url_pattern().replace_all(text, |caps: &regex::Captures<'_>| {
        mask_url(caps.get(0).map(|m| m.as_str()).unwrap_or_default())
    });
    let masked = email_pattern().replace_all(&masked, |caps: &regex::Captures<'_>| {
        mask_email(caps.get(0).map(|m| m.as_str()).unwrap_or_default())
    });
    // The URL pass leaves preserved tails like "***.co.uk" behind; those must
    // not be re-matched as bare domains.
    let mut out = String::with_capacity(masked.len());
    let mut last = 0;
    for m in domain_pattern().find_iter(&masked) {
        out.push_str(&masked[last..m.start()]);
        if masked[..m.start()].ends_with("***.") {
            out.push_str(m.as_str());
        } else {
            out.push_str(&mask_plain_domain(m.as_str()));
        }
        last = m.end();
    }
    out.push_str(&masked[last..]);
    ipv4_pattern()
        .replace_all(&out, "***.***.***.***")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_url_keeping_scheme_and_tld() {
        assert_eq!(mask_sensitive_info("http://example.com"), "http://***.com");
        assert_eq!(
            mask_sensitive_info("https://api.test.org/v1/users/123?key=secret"),
            "https://***.org/***/***/***?key=***"
        );
        assert_eq!(
            mask_sensitive_info("https://sub.domain.co.uk/path/to/resource"),
            "https://***.co.uk/***/***/***"
        );
    }

    #[test]
    fn masks_plain_domains_with_subdomain_depth() {
        assert_eq!(mask_sensitive_info("openai.com"), "***.com");
        assert_eq!(mask_sensitive_info("api.openai.com"), "***.***.com");
    }

    #[test]
    fn masks_ipv4() {
        assert_eq!(
            mask_sensitive_info("connect to 192.168.1.1 failed"),
            "connect to ***.***.***.*** failed"
        );
    }

    #[test]
    fn masks_email_local_part() {
        assert_eq!(mask_email("user@corp.example"), "***@corp.example");
        assert_eq!(mask_email("not-an-email"), "***masked***");
        assert_eq!(
            mask_sensitive_info("reported by admin@vendor.io"),
            "reported by ***@***.io"
        );
    }

    #[test]
    fn plain_text_untouched() {
        assert_eq!(
            mask_sensitive_info("invalid api key supplied"),
            "invalid api key supplied"
        );
    }
}
