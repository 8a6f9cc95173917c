//! HTTP Basic authorization.
//!
//! Rules are checked in the order they were configured and the first rule whose methods and
//! target match the request decides. Passwords are compared as plain text. Accept lists then
//! narrow which authenticated users may enter a path prefix.

use crate::text::{base64_decode, strip_prefix_ignore_case, trim};

/// User name and password from an `Authorization: Basic` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    /// Decode an `Authorization` header value. Other schemes yield `None`.
    pub fn from_header(value: &str) -> Option<Self> {
        let encoded = strip_prefix_ignore_case(trim(value), "basic ")?;
        let decoded = String::from_utf8(base64_decode(trim(encoded))).ok()?;
        let (user, password) = match decoded.split_once(':') {
            Some((user, password)) => (user, password),
            None => (decoded.as_str(), ""),
        };
        Some(Self {
            user: user.to_string(),
            password: password.to_string(),
        })
    }
}

/// A protected path prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicAuthRule {
    /// Path prefix; empty protects everything.
    pub target: String,
    /// Methods the rule applies to; empty means all methods.
    pub methods: Vec<String>,
    pub realm: String,
    /// (user, password) pairs.
    pub users: Vec<(String, String)>,
}

impl BasicAuthRule {
    fn matches(&self, method: &str, path: &str) -> bool {
        (self.methods.is_empty() || self.methods.iter().any(|m| m == method))
            && path.starts_with(&self.target)
    }

    fn admits(&self, credentials: &Credentials) -> bool {
        self.users
            .iter()
            .any(|(user, password)| *user == credentials.user && *password == credentials.password)
    }

    /// Value of the `WWW-Authenticate` header.
    pub fn challenge(&self) -> String {
        if self.realm.is_empty() {
            "Basic".to_string()
        } else {
            format!("Basic realm=\"{}\"", self.realm)
        }
    }
}

/// Users allowed under a path prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptList {
    pub prefix: String,
    pub users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// Carries the `WWW-Authenticate` value to send back.
    Unauthorized(String),
}

/// Decide whether a request may proceed.
pub fn authorize(
    rules: &[BasicAuthRule],
    accept_lists: &[AcceptList],
    method: &str,
    path: &str,
    credentials: Option<&Credentials>,
) -> Decision {
    let rule = rules.iter().find(|rule| rule.matches(method, path));
    let challenge = || {
        rule.map(BasicAuthRule::challenge)
            .unwrap_or_else(|| "Basic".to_string())
    };

    if let Some(rule) = rule {
        match credentials {
            Some(credentials) if rule.admits(credentials) => {
                log::debug!("authorized {} for {}", credentials.user, path);
            }
            _ => return Decision::Unauthorized(rule.challenge()),
        }
    }

    if let Some(credentials) = credentials {
        let refused = accept_lists.iter().any(|accept| {
            path.starts_with(&accept.prefix) && !accept.users.contains(&credentials.user)
        });
        if refused {
            return Decision::Unauthorized(challenge());
        }
    }

    Decision::Allowed
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    fn rule(target: &str, methods: &[&str], realm: &str) -> BasicAuthRule {
        BasicAuthRule {
            target: target.to_string(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            realm: realm.to_string(),
            users: vec![("alice".to_string(), "secret".to_string())],
        }
    }

    fn alice() -> Credentials {
        Credentials {
            user: "alice".to_string(),
            password: "secret".to_string(),
        }
    }

    #[test_case("Basic YWxpY2U6c2VjcmV0", Some(("alice", "secret")) ; "basic")]
    #[test_case("basic YWxpY2U6c2VjcmV0", Some(("alice", "secret")) ; "lowercase scheme")]
    #[test_case("Basic YWxpY2U6YTpi", Some(("alice", "a:b")) ; "colon in password")]
    #[test_case("Basic YWxpY2U=", Some(("alice", "")) ; "no password")]
    #[test_case("Bearer abc", None ; "other scheme")]
    fn credentials_from_header_works(header: &str, expected: Option<(&str, &str)>) {
        let expected = expected.map(|(user, password)| Credentials {
            user: user.to_string(),
            password: password.to_string(),
        });
        assert_eq!(Credentials::from_header(header), expected);
    }

    #[test]
    fn unmatched_request_is_allowed() {
        let rules = vec![rule("/private", &[], "Private")];
        assert_eq!(authorize(&rules, &[], "GET", "/public/x", None), Decision::Allowed);
    }

    #[test]
    fn first_matching_rule_decides() {
        let rules = vec![
            rule("/private", &["POST"], "Posting"),
            rule("/private", &["GET", "HEAD"], "Reading"),
            rule("/", &[], "Everything"),
        ];
        assert_eq!(
            authorize(&rules, &[], "GET", "/private/x", None),
            Decision::Unauthorized("Basic realm=\"Reading\"".to_string())
        );
        assert_eq!(
            authorize(&rules, &[], "POST", "/private/x", None),
            Decision::Unauthorized("Basic realm=\"Posting\"".to_string())
        );
        assert_eq!(
            authorize(&rules, &[], "GET", "/other", None),
            Decision::Unauthorized("Basic realm=\"Everything\"".to_string())
        );
    }

    #[test]
    fn credentials_must_match_rule() {
        let rules = vec![rule("/private", &[], "Private")];
        assert_eq!(
            authorize(&rules, &[], "GET", "/private/x", Some(&alice())),
            Decision::Allowed
        );
        let wrong = Credentials {
            user: "alice".to_string(),
            password: "guess".to_string(),
        };
        assert_eq!(
            authorize(&rules, &[], "GET", "/private/x", Some(&wrong)),
            Decision::Unauthorized("Basic realm=\"Private\"".to_string())
        );
    }

    #[test]
    fn accept_list_restricts_authenticated_users() {
        let rules = vec![rule("/", &[], "Site")];
        let accept_lists = vec![AcceptList {
            prefix: "/admin".to_string(),
            users: vec!["root".to_string()],
        }];
        assert_eq!(
            authorize(&rules, &accept_lists, "GET", "/index.html", Some(&alice())),
            Decision::Allowed
        );
        assert_eq!(
            authorize(&rules, &accept_lists, "GET", "/admin/", Some(&alice())),
            Decision::Unauthorized("Basic realm=\"Site\"".to_string())
        );
    }

    #[test]
    fn empty_realm_challenge_has_no_realm() {
        assert_eq!(rule("/", &[], "").challenge(), "Basic");
    }
}
