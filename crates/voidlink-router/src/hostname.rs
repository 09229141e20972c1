//! Subdomain extraction from client-supplied hostnames
//!
//! Both shared proxies route by the same rule: the subdomain is the label
//! the incoming address contributes over the configured base domain.
//! `happy-cat.eu.example.com` and `map.happy-cat.eu.example.com` both route
//! to `happy-cat` when the base domain is `eu.example.com`.

/// Strip a trailing `:port` from a host, if present. Bare IPv6 literals
/// (more than one colon) are left untouched.
pub fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((h, p))
            if !h.is_empty()
                && !h.contains(':')
                && !p.is_empty()
                && p.bytes().all(|b| b.is_ascii_digit()) =>
        {
            h
        }
        _ => host,
    }
}

/// Extract the routing subdomain from `addr` relative to `base_domain`.
///
/// The address is lower-cased and its port stripped first. When the address
/// ends in `.{base_domain}`, the last dot-separated label of the remainder
/// is the subdomain (so `map.happy-cat` still yields `happy-cat`). Addresses
/// outside the base domain fall back to their first label, which lets bare
/// names and direct-IP setups still resolve when such a subdomain exists.
pub fn extract_subdomain(addr: &str, base_domain: &str) -> Option<String> {
    let host = strip_port(addr).to_ascii_lowercase();
    let domain = base_domain.to_ascii_lowercase();

    let suffix = format!(".{domain}");
    let label = match host.strip_suffix(&suffix) {
        Some(prefix) => prefix.rsplit('.').next().unwrap_or(""),
        None => host.split('.').next().unwrap_or(""),
    };

    if label.is_empty() {
        return None;
    }
    Some(label.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = "eu.example.com";

    #[test]
    fn direct_subdomain() {
        assert_eq!(
            extract_subdomain("happy-cat.eu.example.com", DOMAIN),
            Some("happy-cat".to_string())
        );
    }

    #[test]
    fn deeper_label_routes_to_last() {
        assert_eq!(
            extract_subdomain("map.happy-cat.eu.example.com", DOMAIN),
            Some("happy-cat".to_string())
        );
    }

    #[test]
    fn port_is_stripped() {
        assert_eq!(
            extract_subdomain("alpha.eu.example.com:25565", DOMAIN),
            Some("alpha".to_string())
        );
    }

    #[test]
    fn case_is_folded() {
        assert_eq!(
            extract_subdomain("Happy-Cat.EU.Example.COM", DOMAIN),
            Some("happy-cat".to_string())
        );
    }

    #[test]
    fn address_outside_base_domain_uses_first_label() {
        assert_eq!(
            extract_subdomain("gamma.other.net", DOMAIN),
            Some("gamma".to_string())
        );
    }

    #[test]
    fn bare_base_domain_falls_back_to_first_label() {
        // No label contributed over the base domain; the fallback picks the
        // first label, which normally matches no registered subdomain.
        assert_eq!(
            extract_subdomain("eu.example.com", DOMAIN),
            Some("eu".to_string())
        );
    }

    #[test]
    fn dot_prefixed_base_domain_yields_nothing() {
        assert_eq!(extract_subdomain(".eu.example.com", DOMAIN), None);
    }

    #[test]
    fn ipv6_literal_is_left_alone_by_port_strip() {
        // Not a valid tunnel address either way; just must not panic.
        assert_eq!(strip_port("::1"), "::1");
        assert_eq!(strip_port("host:"), "host:");
    }
}
