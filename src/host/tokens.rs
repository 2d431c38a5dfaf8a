//! Provisioning and server JWTs
//!
//! Nodes present a provisioning JWT that proves they were booted with a
//! token minted by the fleet operator. After a node has proven possession
//! of a fresh Ed25519 key, the provisioner issues it a server JWT bound to
//! that key.
//!
//! # Key material
//!
//! - `jwt_verify_cert`: either a 64 character hex Ed25519 public key or a
//!   PEM file holding a certificate or public key (RSA or Ed25519)
//! - `jwt_signing_key`: a file holding either a hex Ed25519 seed (tokens
//!   are signed EdDSA) or an RSA private key in PEM (tokens are signed RS512)
//! - `jwt_signing_token`: optional chain-of-trust token describing the
//!   signing key. It is read again on every issuance so rotated material
//!   takes effect without a restart.

use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::{Signer, SigningKey};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;
use x509_parser::prelude::{FromDer, SubjectPublicKeyInfo};

use crate::types::{ProvisionerError, Result};

/// Purpose claim of provisioning tokens
pub const PROVISIONING_PURPOSE: &str = "choria_provisioning";

/// Purpose claim of issued server tokens
pub const SERVER_PURPOSE: &str = "choria_server";

/// Issuer of server tokens signed without a chain of trust
pub const DEFAULT_ISSUER: &str = "Choria Provisioner";

/// Prefix of chained issuers
pub const CHAIN_ISSUER_PREFIX: &str = "C-";

const OID_RSA: &str = "1.2.840.113549.1.1.1";
const OID_ED25519: &str = "1.3.101.112";

const RSA_ALGORITHMS: &[Algorithm] = &[Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];
const ED25519_ALGORITHMS: &[Algorithm] = &[Algorithm::EdDSA];

// =============================================================================
// Provisioning tokens
// =============================================================================

/// Claims carried by a node's provisioning JWT
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningClaims {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub purpose: String,
    /// Token the node must present back
    #[serde(rename = "cht", default)]
    pub token: String,
    /// Provisioning broker URLs
    #[serde(rename = "chu", default)]
    pub urls: String,
    #[serde(rename = "chs", default)]
    pub secure: bool,
    #[serde(rename = "chsrv", default)]
    pub srv_domain: String,
    /// Whether the token is the default provisioning token
    #[serde(rename = "chpd", default)]
    pub provision_default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(rename = "ext", default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Value>,
}

fn is_hex_key(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn spki_key(spki: &SubjectPublicKeyInfo) -> Result<(DecodingKey, &'static [Algorithm])> {
    let key: &[u8] = &spki.subject_public_key.data;
    match spki.algorithm.algorithm.to_id_string().as_str() {
        OID_RSA => Ok((DecodingKey::from_rsa_der(key), RSA_ALGORITHMS)),
        OID_ED25519 => Ok((DecodingKey::from_ed_der(key), ED25519_ALGORITHMS)),
        other => Err(ProvisionerError::Jwt(format!(
            "unsupported public key algorithm {}",
            other
        ))),
    }
}

/// Load the key used to verify provisioning tokens
fn verification_key(source: &str) -> Result<(DecodingKey, &'static [Algorithm])> {
    let source = source.trim();

    if is_hex_key(source) {
        let raw = hex::decode(source)
            .map_err(|e| ProvisionerError::Jwt(format!("invalid ed25519 public key: {}", e)))?;
        return Ok((DecodingKey::from_ed_der(&raw), ED25519_ALGORITHMS));
    }

    let data = std::fs::read(source)
        .map_err(|e| ProvisionerError::Jwt(format!("could not read {}: {}", source, e)))?;

    let (_, pem) = x509_parser::pem::parse_x509_pem(&data)
        .map_err(|e| ProvisionerError::Jwt(format!("could not parse {}: {}", source, e)))?;

    match pem.label.as_str() {
        "CERTIFICATE" => {
            let cert = pem
                .parse_x509()
                .map_err(|e| ProvisionerError::Jwt(format!("could not parse certificate {}: {}", source, e)))?;
            spki_key(cert.public_key())
        }
        "PUBLIC KEY" => {
            let (_, spki) = SubjectPublicKeyInfo::from_der(&pem.contents)
                .map_err(|e| ProvisionerError::Jwt(format!("could not parse public key {}: {}", source, e)))?;
            spki_key(&spki)
        }
        "RSA PUBLIC KEY" => Ok((DecodingKey::from_rsa_der(&pem.contents), RSA_ALGORITHMS)),
        other => Err(ProvisionerError::Jwt(format!(
            "unsupported PEM block {} in {}",
            other, source
        ))),
    }
}

/// Verify a provisioning JWT against `jwt_verify_cert`
pub fn verify_provisioning_token(token: &str, verify_with: &str) -> Result<ProvisioningClaims> {
    if token.is_empty() {
        return Err(ProvisionerError::Jwt("no JWT received".into()));
    }

    if verify_with.is_empty() {
        return Err(ProvisionerError::Jwt(
            "no JWT verification certificate configured, cannot validate JWT".into(),
        ));
    }

    let header = decode_header(token)?;
    let (key, allowed) = verification_key(verify_with)?;
    if !allowed.contains(&header.alg) {
        return Err(ProvisionerError::Jwt(format!(
            "token signed with {:?} does not match the verification key",
            header.alg
        )));
    }

    let mut validation = Validation::new(header.alg);
    validation.required_spec_claims = HashSet::new();
    validation.validate_aud = false;

    let claims = decode::<ProvisioningClaims>(token, &key, &validation)?.claims;

    if !claims.purpose.is_empty() && claims.purpose != PROVISIONING_PURPOSE {
        return Err(ProvisionerError::Jwt(format!(
            "not a provisioning token, purpose is {}",
            claims.purpose
        )));
    }

    Ok(claims)
}

// =============================================================================
// Server tokens
// =============================================================================

/// Permissions granted to a provisioned server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPermissions {
    #[serde(default)]
    pub submission: bool,
    #[serde(default)]
    pub streams: bool,
    #[serde(default)]
    pub governor: bool,
    #[serde(default)]
    pub service_host: bool,
}

/// Claim overrides a helper may return for the server token
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerClaimOverrides {
    #[serde(default)]
    pub ou: String,
    /// Absolute expiry, seconds since the epoch
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub collectives: Vec<String>,
    #[serde(default)]
    pub pub_subjects: Vec<String>,
    #[serde(default)]
    pub permissions: Option<ServerPermissions>,
}

/// Claims of an issued server token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerClaims {
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
    pub purpose: String,
    /// Hex encoded Ed25519 public key of the server
    pub public_key: String,
    pub collectives: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ou: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pub_subjects: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<ServerPermissions>,
    /// Chain-of-trust signature, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcs: Option<String>,
}

impl ServerClaims {
    /// Build claims for `identity`, applying helper supplied overrides
    pub fn build(
        identity: &str,
        public_key: &str,
        configuration: &HashMap<String, String>,
        overrides: Option<&ServerClaimOverrides>,
        validity: Duration,
        now: i64,
    ) -> Result<Self> {
        if public_key.is_empty() {
            return Err(ProvisionerError::Jwt("no ed25519 public key set".into()));
        }

        if validity.is_zero() {
            return Err(ProvisionerError::Jwt("no default validity configured".into()));
        }

        hex::decode(public_key)
            .map_err(|e| ProvisionerError::Jwt(format!("invalid ed25519 public key: {}", e)))?;

        let mut org = "choria".to_string();
        let mut exp = now + validity.as_secs() as i64;
        let mut collectives = match configuration.get("collectives") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect(),
            None => vec!["mcollective".to_string()],
        };
        let mut pub_subjects = Vec::new();
        let mut permissions = None;

        if let Some(o) = overrides {
            if !o.ou.is_empty() {
                org = o.ou.clone();
            }
            match o.exp {
                Some(e) if e > now => exp = e,
                Some(e) => warn!(identity = %identity, "Ignoring expiry claim {} in the past", e),
                None => {}
            }
            if !o.collectives.is_empty() {
                collectives = o.collectives.clone();
            }
            if !o.pub_subjects.is_empty() {
                pub_subjects = o.pub_subjects.clone();
            }
            if o.permissions.is_some() {
                permissions = o.permissions.clone();
            }
        }

        Ok(Self {
            sub: identity.to_string(),
            iss: DEFAULT_ISSUER.to_string(),
            iat: now,
            nbf: now,
            exp,
            jti: Uuid::new_v4().to_string(),
            purpose: SERVER_PURPOSE.to_string(),
            public_key: public_key.to_string(),
            collectives,
            ou: org,
            pub_subjects,
            permissions,
            tcs: None,
        })
    }
}

enum SigningMaterial {
    Ed25519(SigningKey),
    Rsa(EncodingKey),
}

fn load_signing_key(path: &str) -> Result<SigningMaterial> {
    if path.is_empty() {
        return Err(ProvisionerError::Jwt(
            "no jwt signing key configured using jwt_signing_key".into(),
        ));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ProvisionerError::Jwt(format!("could not read signing key {}: {}", path, e)))?;
    let content = content.trim();

    if content.chars().all(|c| c.is_ascii_hexdigit()) && (content.len() == 64 || content.len() == 128) {
        let raw = hex::decode(content)
            .map_err(|e| ProvisionerError::Jwt(format!("invalid ed25519 seed in {}: {}", path, e)))?;
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&raw[..32]);
        return Ok(SigningMaterial::Ed25519(SigningKey::from_bytes(&seed)));
    }

    EncodingKey::from_rsa_pem(content.as_bytes())
        .map(SigningMaterial::Rsa)
        .map_err(|e| ProvisionerError::Jwt(format!("invalid RSA signing key {}: {}", path, e)))
}

/// Claims of the chain-of-trust token describing the signing key
#[derive(Debug, Deserialize)]
struct SigningTokenClaims {
    #[serde(default)]
    jti: Option<String>,
    #[serde(default)]
    public_key: Option<String>,
}

fn read_signing_token(path: &str) -> Result<SigningTokenClaims> {
    let token = std::fs::read_to_string(path)
        .map_err(|e| ProvisionerError::Jwt(format!("could not read signing token {}: {}", path, e)))?;

    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.required_spec_claims = HashSet::new();
    validation.validate_exp = false;
    validation.validate_aud = false;

    let claims = decode::<SigningTokenClaims>(token.trim(), &DecodingKey::from_secret(&[]), &validation)?
        .claims;

    Ok(claims)
}

/// Sign `claims` with the configured key, chaining to `signing_token` when set
pub fn sign_server_token(
    mut claims: ServerClaims,
    signing_key: &str,
    signing_token: &str,
) -> Result<String> {
    let material = load_signing_key(signing_key)?;

    if !signing_token.is_empty() {
        let chain = read_signing_token(signing_token)?;
        let jti = chain
            .jti
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ProvisionerError::Jwt("signing token has no id".into()))?;
        let public_key = chain
            .public_key
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ProvisionerError::Jwt("signing token has no public key".into()))?;

        let SigningMaterial::Ed25519(key) = &material else {
            return Err(ProvisionerError::Jwt(
                "chain of trust signatures require an ed25519 signing key".into(),
            ));
        };

        claims.iss = format!("{}{}.{}", CHAIN_ISSUER_PREFIX, jti, public_key);
        let data = format!("{}.{}", claims.jti, claims.public_key);
        claims.tcs = Some(hex::encode(key.sign(data.as_bytes()).to_bytes()));
    }

    match material {
        SigningMaterial::Ed25519(key) => {
            let der = key
                .to_pkcs8_der()
                .map_err(|e| ProvisionerError::Jwt(format!("could not encode signing key: {}", e)))?;
            let encoding = EncodingKey::from_ed_der(der.as_bytes());
            Ok(encode(&Header::new(Algorithm::EdDSA), &claims, &encoding)?)
        }
        SigningMaterial::Rsa(encoding) => Ok(encode(&Header::new(Algorithm::RS512), &claims, &encoding)?),
    }
}
