//! Certificate signing request checks
//!
//! A node may only ask for a certificate in its own name, and none of the
//! requested names may match the deny-list. Deny-list entries wrapped in
//! slashes (`/.../`) have the slashes removed; every entry is then used as
//! an unanchored regular expression.

use regex::Regex;
use tracing::{error, warn};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use crate::types::{ProvisionerError, Result};

/// Names requested by a CSR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrNames {
    pub common_name: String,
    pub dns_names: Vec<String>,
}

impl CsrNames {
    /// Common name followed by every DNS SAN
    pub fn all(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.common_name.as_str()).chain(self.dns_names.iter().map(String::as_str))
    }
}

/// Extract the subject common name and DNS SANs from a PEM CSR
pub fn csr_names(pem: &str) -> Result<CsrNames> {
    let (_, block) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| ProvisionerError::Validation(format!("could not parse CSR: {}", e)))?;

    let (_, csr) = X509CertificationRequest::from_der(&block.contents)
        .map_err(|e| ProvisionerError::Validation(format!("could not parse CSR: {}", e)))?;

    let common_name = csr
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut dns_names = Vec::new();
    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for name in &san.general_names {
                    if let GeneralName::DNSName(dns) = name {
                        dns_names.push(dns.to_string());
                    }
                }
            }
        }
    }

    Ok(CsrNames {
        common_name,
        dns_names,
    })
}

fn strip_delimiters(pattern: &str) -> &str {
    if pattern.len() > 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        pattern.trim_start_matches('/').trim_end_matches('/')
    } else {
        pattern
    }
}

/// True when `name` matches any deny-list pattern
pub fn match_any_regex(name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        let pattern = strip_delimiters(pattern);
        match Regex::new(pattern) {
            Ok(re) => re.is_match(name),
            Err(e) => {
                warn!("Ignoring invalid certificate deny pattern {}: {}", pattern, e);
                false
            }
        }
    })
}

/// Validate a CSR against the node identity and the deny-list
pub fn validate_csr(pem: &str, identity: &str, deny_list: &[String]) -> Result<()> {
    if pem.is_empty() {
        return Err(ProvisionerError::Validation("no CSR received".into()));
    }

    let names = csr_names(pem)?;

    if names.common_name != identity {
        return Err(ProvisionerError::Validation(format!(
            "common name {} does not match identity {}",
            names.common_name, identity
        )));
    }

    for name in names.all() {
        if match_any_regex(name, deny_list) {
            error!(
                identity = %identity,
                "Denying CSR with name {} due to pattern {}",
                name,
                deny_list.join(", ")
            );
            return Err(ProvisionerError::Validation(format!(
                "{} matches denied certificate pattern",
                name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CERT_DENY_LIST;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    fn gencsr(cn: &str, alt_names: &[&str]) -> String {
        let mut params =
            CertificateParams::new(alt_names.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                .unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, cn);
        let key = KeyPair::generate().unwrap();
        params.serialize_request(&key).unwrap().pem().unwrap()
    }

    fn deny_list() -> Vec<String> {
        DEFAULT_CERT_DENY_LIST.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_no_csr() {
        let err = validate_csr("", "n1.example.net", &deny_list()).unwrap_err();
        assert_eq!(err.to_string(), "no CSR received");
    }

    #[test]
    fn test_unparsable_csr() {
        let err = validate_csr("garbage", "n1.example.net", &deny_list()).unwrap_err();
        assert!(err.to_string().starts_with("could not parse CSR"));
    }

    #[test]
    fn test_names_must_match_identity() {
        let csr = gencsr("a.example.net", &[]);
        let err = validate_csr(&csr, "b.example.net", &deny_list()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "common name a.example.net does not match identity b.example.net"
        );
    }

    #[test]
    fn test_denied_common_names() {
        for name in ["bob.choria", "bob.mcollective", "bob.privileged.choria", "bob.privileged.mcollective"] {
            let csr = gencsr(name, &[]);
            let err = validate_csr(&csr, name, &deny_list()).unwrap_err();
            assert_eq!(err.to_string(), format!("{} matches denied certificate pattern", name));
        }
    }

    #[test]
    fn test_denied_dns_names() {
        let csr = gencsr("ginkgo.example.net", &["something.something", "bob.mcollective", "something.else"]);
        let err = validate_csr(&csr, "ginkgo.example.net", &deny_list()).unwrap_err();
        assert_eq!(err.to_string(), "bob.mcollective matches denied certificate pattern");
    }

    #[test]
    fn test_valid_names() {
        let csr = gencsr("ginkgo.example.net", &["something.something", "something.else"]);
        assert!(validate_csr(&csr, "ginkgo.example.net", &deny_list()).is_ok());

        let names = csr_names(&csr).unwrap();
        assert_eq!(names.common_name, "ginkgo.example.net");
        assert_eq!(names.dns_names, vec!["something.something", "something.else"]);
    }

    #[test]
    fn test_single_pattern_list() {
        let list = vec!["\\.mcollective$".to_string()];

        let csr = gencsr("evil.mcollective", &[]);
        let err = validate_csr(&csr, "evil.mcollective", &list).unwrap_err();
        assert_eq!(err.to_string(), "evil.mcollective matches denied certificate pattern");

        let csr = gencsr("ok.example.net", &[]);
        assert!(validate_csr(&csr, "ok.example.net", &list).is_ok());
    }

    #[test]
    fn test_slash_delimited_patterns() {
        let list = vec!["/^admin\\./".to_string()];
        assert!(match_any_regex("admin.example.net", &list));
        assert!(!match_any_regex("web.admin.example.net", &list));

        // bare patterns are unanchored
        let list = vec!["admin".to_string()];
        assert!(match_any_regex("web.admin.example.net", &list));
    }
}
