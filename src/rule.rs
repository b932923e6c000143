//! Routing rule expressions
//!
//! Supported forms:
//! - ``Host(`api.example.com`)``
//! - ``Host(`a.example.com`, `b.example.com`)``
//! - ``Host(`a.example.com`) || Host(`*.example.com`)``
//! - ``Host(`api.example.com`) && PathPrefix(`/v1`)``
//!
//! A path prefix applies to every host in the rule.

use crate::error::GatewayError;

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// Result of parsing a rule expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRule {
    /// Normalized host patterns (exact or `*.` wildcard)
    pub hosts: Vec<String>,
    /// Optional path prefix, always starting with `/`
    pub path_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Matcher { name: String, args: Vec<String> },
    And,
    Or,
}

/// Parse a rule expression into hosts and an optional path prefix
pub fn parse_rule(rule: &str) -> Result<ParsedRule, GatewayError> {
    let tokens = tokenize(rule)?;
    if tokens.is_empty() {
        return Err(config_error(rule, "rule is empty"));
    }

    let mut hosts = Vec::new();
    let mut path_prefix = None;
    let mut expect_matcher = true;
    let mut previous_op: Option<&Token> = None;

    for token in &tokens {
        match token {
            Token::Matcher { name, args } => {
                if !expect_matcher {
                    return Err(config_error(rule, "missing operator between matchers"));
                }
                expect_matcher = false;
                match name.as_str() {
                    "Host" => {
                        if args.is_empty() {
                            return Err(config_error(rule, "Host() requires at least one domain"));
                        }
                        for arg in args {
                            let host = normalize_host_pattern(arg)
                                .map_err(|reason| config_error(rule, &reason))?;
                            if !hosts.contains(&host) {
                                hosts.push(host);
                            }
                        }
                    }
                    "PathPrefix" => {
                        if matches!(previous_op, Some(Token::Or)) {
                            return Err(config_error(rule, "PathPrefix() must be combined with &&"));
                        }
                        if path_prefix.is_some() {
                            return Err(config_error(rule, "only one PathPrefix() is supported"));
                        }
                        let [prefix] = args.as_slice() else {
                            return Err(config_error(rule, "PathPrefix() takes exactly one path"));
                        };
                        if !prefix.starts_with('/') {
                            return Err(config_error(rule, "path prefix must start with '/'"));
                        }
                        path_prefix = Some(prefix.clone());
                    }
                    other => {
                        return Err(config_error(rule, &format!("unsupported matcher '{}'", other)));
                    }
                }
            }
            op @ (Token::And | Token::Or) => {
                if expect_matcher {
                    return Err(config_error(rule, "operator without a preceding matcher"));
                }
                if matches!(op, Token::Or) && path_prefix.is_some() {
                    return Err(config_error(rule, "PathPrefix() must be combined with &&"));
                }
                expect_matcher = true;
                previous_op = Some(op);
            }
        }
    }

    if expect_matcher {
        return Err(config_error(rule, "rule ends with an operator"));
    }
    if hosts.is_empty() {
        return Err(config_error(rule, "rule has no Host() matcher"));
    }

    Ok(ParsedRule { hosts, path_prefix })
}

fn tokenize(rule: &str) -> Result<Vec<Token>, GatewayError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = rule.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '&' || c == '|' {
            if chars.get(i + 1) != Some(&c) {
                return Err(config_error(rule, &format!("expected '{}{}'", c, c)));
            }
            tokens.push(if c == '&' { Token::And } else { Token::Or });
            i += 2;
        } else if c.is_ascii_alphabetic() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_alphanumeric() {
                i += 1;
            }
            let name: String = chars[start..i].iter().collect();
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            if chars.get(i) != Some(&'(') {
                return Err(config_error(rule, &format!("expected '(' after {}", name)));
            }
            i += 1;

            let mut args = Vec::new();
            loop {
                while i < chars.len() && chars[i].is_whitespace() {
                    i += 1;
                }
                match chars.get(i) {
                    Some(')') => {
                        i += 1;
                        break;
                    }
                    Some('`') => {
                        let start = i + 1;
                        let end = chars[start..]
                            .iter()
                            .position(|&c| c == '`')
                            .map(|p| start + p)
                            .ok_or_else(|| config_error(rule, "unterminated backtick"))?;
                        args.push(chars[start..end].iter().collect());
                        i = end + 1;
                        while i < chars.len() && chars[i].is_whitespace() {
                            i += 1;
                        }
                        match chars.get(i) {
                            Some(',') => i += 1,
                            Some(')') => {}
                            _ => return Err(config_error(rule, "expected ',' or ')'")),
                        }
                    }
                    _ => return Err(config_error(rule, "arguments must be backtick-quoted")),
                }
            }
            tokens.push(Token::Matcher { name, args });
        } else {
            return Err(config_error(rule, &format!("unexpected character '{}'", c)));
        }
    }

    Ok(tokens)
}

/// Normalize and validate a host pattern (`example.com` or `*.example.com`)
pub fn normalize_host_pattern(host: &str) -> Result<String, String> {
    let host = host.trim().trim_end_matches('.').to_lowercase();

    if host.is_empty() {
        return Err("domain cannot be empty".to_string());
    }
    if host.len() > MAX_HOSTNAME_LEN {
        return Err("domain name too long".to_string());
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '*')
    {
        return Err(format!("domain '{}' contains invalid characters", host));
    }
    if host.contains('*') && (!host.starts_with("*.") || host[1..].contains('*')) {
        return Err(format!("wildcard in '{}' must be a leading '*.' label", host));
    }
    if host.split('.').any(|label| label.is_empty()) {
        return Err(format!("domain '{}' has an empty label", host));
    }

    Ok(host)
}

fn config_error(rule: &str, reason: &str) -> GatewayError {
    GatewayError::Config(format!("invalid rule '{}': {}", rule, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_host() {
        let rule = parse_rule("Host(`api.example.com`)").unwrap();
        assert_eq!(rule.hosts, vec!["api.example.com"]);
        assert_eq!(rule.path_prefix, None);
    }

    #[test]
    fn test_host_is_lowercased() {
        let rule = parse_rule("Host(`API.Example.COM`)").unwrap();
        assert_eq!(rule.hosts, vec!["api.example.com"]);
    }

    #[test]
    fn test_multiple_hosts_in_one_matcher() {
        let rule = parse_rule("Host(`a.example.com`, `b.example.com`)").unwrap();
        assert_eq!(rule.hosts, vec!["a.example.com", "b.example.com"]);
    }

    #[test]
    fn test_or_of_hosts() {
        let rule = parse_rule("Host(`a.example.com`) || Host(`*.example.com`)").unwrap();
        assert_eq!(rule.hosts, vec!["a.example.com", "*.example.com"]);
    }

    #[test]
    fn test_host_and_path_prefix() {
        let rule = parse_rule("Host(`api.example.com`) && PathPrefix(`/v1`)").unwrap();
        assert_eq!(rule.hosts, vec!["api.example.com"]);
        assert_eq!(rule.path_prefix.as_deref(), Some("/v1"));
    }

    #[test]
    fn test_rejects_path_prefix_with_or() {
        assert!(parse_rule("Host(`a.com`) || PathPrefix(`/v1`)").is_err());
        assert!(parse_rule("Host(`a.com`) && PathPrefix(`/v1`) || Host(`b.com`)").is_err());
    }

    #[test]
    fn test_rejects_malformed_rules() {
        assert!(parse_rule("").is_err());
        assert!(parse_rule("Host(api.example.com)").is_err());
        assert!(parse_rule("Host(`api.example.com`").is_err());
        assert!(parse_rule("Host(`a.com`) &&").is_err());
        assert!(parse_rule("Host(`a.com`) Host(`b.com`)").is_err());
        assert!(parse_rule("Host(`a.com`) & Host(`b.com`)").is_err());
        assert!(parse_rule("HostRegexp(`.*`)").is_err());
        assert!(parse_rule("PathPrefix(`/v1`)").is_err());
        assert!(parse_rule("Host()").is_err());
    }

    #[test]
    fn test_rejects_bad_hosts() {
        assert!(parse_rule("Host(`bad host.com`)").is_err());
        assert!(parse_rule("Host(`api.*.example.com`)").is_err());
        assert!(parse_rule("Host(`a..com`)").is_err());
    }

    #[test]
    fn test_normalize_host_pattern() {
        assert_eq!(normalize_host_pattern("Example.COM.").unwrap(), "example.com");
        assert_eq!(normalize_host_pattern("*.example.com").unwrap(), "*.example.com");
        assert!(normalize_host_pattern("*example.com").is_err());
        assert!(normalize_host_pattern("").is_err());
        assert!(normalize_host_pattern(&"a".repeat(300)).is_err());
    }
}
