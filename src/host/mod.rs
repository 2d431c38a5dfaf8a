//! Per-node provisioning state machine
//!
//! A [`Host`] is created for every node found in provisioning mode and is
//! driven through the bootstrap sequence by [`Host::provision`]:
//!
//! 1. staleness check
//! 2. provisioning JWT fetch and validation (`jwt` feature)
//! 3. Ed25519 key fetch with nonce proof (`ed25519` feature)
//! 4. inventory fetch
//! 5. CSR fetch and validation (`pki` feature)
//! 6. configuration from the helper, which may defer or shut the node down
//! 7. server JWT issuance (`ed25519` feature)
//! 8. private key encryption for the node
//! 9. version upgrade (`upgrades` feature)
//! 10. configure and restart
//!
//! Failures are wrapped with the step and node identity and handed back to
//! the worker, which owns logging and metrics for terminal outcomes.

pub mod crypto;
pub mod csr;
pub mod helper;
pub mod rpc;
pub mod tokens;
pub mod version;

use rand::RngCore;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentClient, CsrReply, Ed25519Reply};
use crate::config::ProvisionerConfig;
use crate::events::{EventPublisher, NoopPublisher};
use crate::metrics::{Observer, Timer, HELPER_ERRORS, HELPER_TIME};
use crate::nats::messages::PROVISIONER_COMPONENT;
use crate::nats::{LifecycleEvent, LifecycleKind};
use crate::pause::PauseGate;
use crate::retry::RetryPolicy;
use crate::types::{ProvisionerError, Result};

use self::helper::{ConfigHelper, HelperResponse};
use self::rpc::{ConfigureRequest, ProvisionAgent};
use self::tokens::{ProvisioningClaims, ServerClaimOverrides, ServerClaims};
use self::version::{SemverComparator, VersionComparator};

// =============================================================================
// Context
// =============================================================================

/// Collaborators shared by every host
#[derive(Clone)]
pub struct HostContext {
    pub config: Arc<ProvisionerConfig>,
    pub gate: Arc<PauseGate>,
    pub observer: Arc<dyn Observer>,
    pub agent: Arc<dyn AgentClient>,
    pub helper: Arc<dyn ConfigHelper>,
    pub events: Arc<dyn EventPublisher>,
    pub versions: Arc<dyn VersionComparator>,
    /// First backoff delay of every retry policy
    pub retry_base: Duration,
}

impl HostContext {
    pub fn new(
        config: Arc<ProvisionerConfig>,
        gate: Arc<PauseGate>,
        observer: Arc<dyn Observer>,
        agent: Arc<dyn AgentClient>,
        helper: Arc<dyn ConfigHelper>,
    ) -> Self {
        Self {
            config,
            gate,
            observer,
            agent,
            helper,
            events: Arc::new(NoopPublisher),
            versions: Arc::new(SemverComparator),
            retry_base: RetryPolicy::default().base,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn with_versions(mut self, versions: Arc<dyn VersionComparator>) -> Self {
        self.versions = versions;
        self
    }

    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    /// Retry policy allowing `tries` attempts
    pub fn policy(&self, tries: u32) -> RetryPolicy {
        RetryPolicy::new(tries).with_base(self.retry_base)
    }

    async fn publish(&self, kind: LifecycleKind, identity: &str) {
        let event = LifecycleEvent::new(kind, identity, PROVISIONER_COMPONENT);
        if let Err(e) = self.events.emit(&event).await {
            warn!(identity = %identity, "Could not publish {} event: {}", kind.as_str(), e);
        }
    }
}

// =============================================================================
// State
// =============================================================================

/// Everything learned about a node during bootstrap.
///
/// The serialized form is the helper's input.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostState {
    pub identity: String,
    pub csr: Option<CsrReply>,
    /// The node's Ed25519 public key, nonce signature and key directory
    pub ed25519_pubkey: Option<Ed25519Reply>,
    /// Complete inventory reply as JSON text
    pub inventory: String,
    pub jwt: Option<ProvisioningClaims>,
    pub version: String,
    pub upgradable: bool,

    #[serde(skip)]
    pub raw_jwt: String,
    #[serde(skip)]
    pub provisioned: bool,
    #[serde(skip)]
    pub configuration: HashMap<String, String>,
    #[serde(skip)]
    pub ca: String,
    #[serde(skip)]
    pub certificate: String,
    #[serde(skip)]
    pub key: String,
    #[serde(skip)]
    pub ssl_dir: String,
    /// Node's X25519 public key from the JWT exchange
    #[serde(skip)]
    pub node_ecdh_public: String,
    /// Ephemeral X25519 public key `key` was encrypted with
    #[serde(skip)]
    pub provisioner_ecdh_public: String,
    #[serde(skip)]
    pub action_policies: HashMap<String, String>,
    #[serde(skip)]
    pub opa_policies: HashMap<String, String>,
    #[serde(skip)]
    pub server_claims: Option<ServerClaimOverrides>,
    #[serde(skip)]
    pub signed_server_jwt: String,
    #[serde(skip)]
    pub upgrade_target: String,
}

impl HostState {
    fn adopt(&mut self, reply: HelperResponse) {
        self.configuration = reply.configuration;
        self.ca = reply.ca;
        self.certificate = reply.certificate;
        self.key = reply.key;
        self.ssl_dir = reply.ssldir;
        self.action_policies = reply.action_policies;
        self.opa_policies = reply.opa_policies;
        self.server_claims = reply.server_claims;
        self.upgrade_target = reply.upgrade;
    }

    /// SSL directory the node reported takes precedence over the helper's
    fn effective_ssl_dir(&self) -> &str {
        match &self.csr {
            Some(csr) if !csr.ssldir.is_empty() => &csr.ssldir,
            _ => &self.ssl_dir,
        }
    }
}

// =============================================================================
// Host
// =============================================================================

/// A node being provisioned
pub struct Host {
    identity: String,
    discovered: Instant,
    state: Mutex<HostState>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("identity", &self.identity)
            .field("discovered", &self.discovered)
            .finish()
    }
}

impl Host {
    pub fn new(identity: &str) -> Self {
        Self::discovered_at(identity, Instant::now())
    }

    pub fn discovered_at(identity: &str, discovered: Instant) -> Self {
        Self {
            identity: identity.to_string(),
            discovered,
            state: Mutex::new(HostState {
                identity: identity.to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Time since the node was discovered
    pub fn age(&self) -> Duration {
        self.discovered.elapsed()
    }

    /// Copy of the current state
    pub async fn state(&self) -> HostState {
        self.state.lock().await.clone()
    }

    /// Drive the node through the bootstrap sequence.
    ///
    /// Returns `Ok(true)` once the node was provisioned or shut down, and
    /// `Ok(false)` when an upgrade was started and the node should be
    /// picked up again after it restarts. Concurrent calls wait for each
    /// other.
    pub async fn provision(&self, ctx: &HostContext, cancel: &CancellationToken) -> Result<bool> {
        let mut state = self.state.lock().await;

        if state.provisioned {
            return Ok(true);
        }

        let waited = self.age();
        if waited > ctx.config.interval_duration * 2 {
            return Err(ProvisionerError::Validation(format!(
                "skipping node that's been waiting {:?}",
                waited
            )));
        }

        let id = self.identity.as_str();
        let agent = ProvisionAgent::new(ctx, id, cancel);
        let features = &ctx.config.features;

        if features.jwt {
            self.fetch_jwt(&mut state, ctx, &agent)
                .await
                .map_err(|e| ProvisionerError::step("fetch JWT", id, e))?;
        }

        if features.ed25519 {
            self.fetch_ed25519(&mut state, &agent)
                .await
                .map_err(|e| ProvisionerError::step("fetch ed25519 public key", id, e))?;
        }

        self.fetch_inventory(&mut state, &agent)
            .await
            .map_err(|e| ProvisionerError::step("fetch inventory", id, e))?;

        if features.pki {
            self.fetch_csr(&mut state, ctx, &agent)
                .await
                .map_err(|e| ProvisionerError::step("fetch CSR", id, e))?;
        }

        let reply = self.run_helper(&state, ctx, cancel).await?;

        if reply.shutdown {
            info!(identity = %id, "Shutting down node on request of the helper: {}", reply.msg);
            agent
                .shutdown()
                .await
                .map_err(|e| ProvisionerError::step("shut down", id, e))?;
            state.provisioned = true;
            ctx.publish(LifecycleKind::Shutdown, id).await;
            return Ok(true);
        }

        state.adopt(reply);

        if features.ed25519 {
            self.sign_server_jwt(&mut state, ctx)
                .map_err(|e| ProvisionerError::step("sign server JWT", id, e))?;
        }

        if !state.key.is_empty() {
            let encrypted = crypto::encrypt_private_key(&state.key, &state.node_ecdh_public)
                .map_err(|e| ProvisionerError::step("encrypt private key", id, e))?;
            state.key = encrypted.pem;
            state.provisioner_ecdh_public = encrypted.public_key;
        }

        if features.version_upgrades && !state.upgrade_target.is_empty() {
            match self.upgrade(&state, ctx, &agent).await {
                Ok(true) => return Ok(false),
                Ok(false) => {}
                Err(e) if ctx.config.upgrades_optional => {
                    warn!(identity = %id, "Continuing without upgrade: {}", e);
                }
                Err(e) => return Err(ProvisionerError::step("upgrade", id, e)),
            }
        }

        self.configure(&state, &agent)
            .await
            .map_err(|e| ProvisionerError::step("configure", id, e))?;

        agent
            .restart()
            .await
            .map_err(|e| ProvisionerError::step("restart", id, e))?;

        state.provisioned = true;
        ctx.publish(LifecycleKind::Provisioned, id).await;

        Ok(true)
    }

    async fn fetch_jwt(
        &self,
        state: &mut HostState,
        ctx: &HostContext,
        agent: &ProvisionAgent<'_>,
    ) -> Result<()> {
        if !state.raw_jwt.is_empty() {
            return Ok(());
        }

        let reply = agent.jwt().await?;
        let claims = tokens::verify_provisioning_token(&reply.jwt, &ctx.config.jwt_verify_cert)?;

        debug!(identity = %self.identity, "Validated provisioning JWT");

        state.raw_jwt = reply.jwt;
        state.node_ecdh_public = reply.ecdh_public;
        state.jwt = Some(claims);

        Ok(())
    }

    async fn fetch_ed25519(&self, state: &mut HostState, agent: &ProvisionAgent<'_>) -> Result<()> {
        if state.ed25519_pubkey.is_some() {
            return Ok(());
        }

        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let nonce = hex::encode(raw);

        let reply = agent.gen25519(&nonce).await?;
        crypto::verify_nonce_signature(&reply.public_key, &reply.signature, &nonce)?;

        state.ed25519_pubkey = Some(reply);

        Ok(())
    }

    async fn fetch_inventory(&self, state: &mut HostState, agent: &ProvisionAgent<'_>) -> Result<()> {
        if !state.inventory.is_empty() {
            return Ok(());
        }

        let reply = agent.inventory().await?;
        state.inventory = reply.json;
        state.version = reply.version;
        state.upgradable = reply.upgradable;

        Ok(())
    }

    async fn fetch_csr(
        &self,
        state: &mut HostState,
        ctx: &HostContext,
        agent: &ProvisionAgent<'_>,
    ) -> Result<()> {
        if state.csr.is_some() {
            return Ok(());
        }

        let reply = agent.gencsr(&self.identity).await?;
        csr::validate_csr(&reply.csr, &self.identity, &ctx.config.cert_deny_list)?;
        state.csr = Some(reply);

        Ok(())
    }

    async fn run_helper(
        &self,
        state: &HostState,
        ctx: &HostContext,
        cancel: &CancellationToken,
    ) -> Result<HelperResponse> {
        let id = self.identity.as_str();
        let label = ctx.helper.name().to_string();

        ctx.gate.check(&format!("helper {}", label))?;

        let input = serde_json::to_string(state)?;
        let result = {
            let _timer = Timer::start(&*ctx.observer, HELPER_TIME, Some(&label));
            ctx.helper.resolve(&input, cancel).await
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                ctx.observer.incr(HELPER_ERRORS, Some(&label));
                return Err(ProvisionerError::step("run helper", id, e));
            }
        };

        if reply.defer {
            return Err(ProvisionerError::Deferred(reply.msg));
        }

        Ok(reply)
    }

    fn sign_server_jwt(&self, state: &mut HostState, ctx: &HostContext) -> Result<()> {
        let public_key = state
            .ed25519_pubkey
            .as_ref()
            .map(|k| k.public_key.as_str())
            .unwrap_or_default();

        let claims = ServerClaims::build(
            &self.identity,
            public_key,
            &state.configuration,
            state.server_claims.as_ref(),
            ctx.config.server_jwt_validity_duration,
            chrono::Utc::now().timestamp(),
        )?;

        state.signed_server_jwt = tokens::sign_server_token(
            claims,
            &ctx.config.jwt_signing_key,
            &ctx.config.jwt_signing_token,
        )?;

        Ok(())
    }

    /// Start an upgrade when the node runs an older version, true when one
    /// was started
    async fn upgrade(
        &self,
        state: &HostState,
        ctx: &HostContext,
        agent: &ProvisionAgent<'_>,
    ) -> Result<bool> {
        if state.version.is_empty() {
            return Err(ProvisionerError::Validation(
                "node did not report its version".into(),
            ));
        }

        match ctx.versions.compare(&state.version, &state.upgrade_target)? {
            Ordering::Less => {}
            _ => {
                debug!(
                    identity = %self.identity,
                    "Version {} satisfies upgrade target {}",
                    state.version,
                    state.upgrade_target
                );
                return Ok(false);
            }
        }

        if !state.upgradable {
            return Err(ProvisionerError::Validation(format!(
                "node is not upgradable from {} to {}",
                state.version, state.upgrade_target
            )));
        }

        agent
            .release_update(&ctx.config.upgrades_repo, &state.upgrade_target)
            .await?;

        info!(
            identity = %self.identity,
            "Upgrading from {} to {}",
            state.version,
            state.upgrade_target
        );

        Ok(true)
    }

    async fn configure(&self, state: &HostState, agent: &ProvisionAgent<'_>) -> Result<()> {
        if state.configuration.is_empty() {
            return Err(ProvisionerError::Validation("empty configuration".into()));
        }

        let request = ConfigureRequest {
            configuration: serde_json::to_string(&state.configuration)?,
            ca: state.ca.clone(),
            certificate: state.certificate.clone(),
            key: state.key.clone(),
            ssldir: state.effective_ssl_dir().to_string(),
            ecdh_public: state.provisioner_ecdh_public.clone(),
            action_policies: state.action_policies.clone(),
            opa_policies: state.opa_policies.clone(),
            server_jwt: state.signed_server_jwt.clone(),
        };

        let reply = agent.configure(&request).await?;
        info!(identity = %self.identity, "Configured node: {}", reply.message);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::JwtReply;
    use crate::metrics::FleetMetrics;
    use crate::nats::RpcReply;
    use async_trait::async_trait;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;

    /// Agent that answers every action with a canned reply and records calls
    #[derive(Default)]
    struct ScriptedAgent {
        replies: HashMap<String, Value>,
        calls: StdMutex<Vec<(String, Value)>>,
        signer: Option<SigningKey>,
    }

    impl ScriptedAgent {
        fn with(mut self, action: &str, reply: Value) -> Self {
            self.replies.insert(action.to_string(), reply);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(a, _)| a.clone()).collect()
        }

        fn data_of(&self, action: &str) -> Option<Value> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .find(|(a, _)| a == action)
                .map(|(_, d)| d.clone())
        }
    }

    #[async_trait]
    impl AgentClient for ScriptedAgent {
        async fn call(
            &self,
            identity: &str,
            _agent: &str,
            action: &str,
            data: Value,
            _cancel: &CancellationToken,
        ) -> Result<Vec<RpcReply>> {
            self.calls.lock().unwrap().push((action.to_string(), data.clone()));

            if action == "gen25519" {
                if let Some(signer) = &self.signer {
                    let nonce = data["nonce"].as_str().unwrap_or_default();
                    let reply = Ed25519Reply {
                        public_key: hex::encode(signer.verifying_key().as_bytes()),
                        signature: hex::encode(signer.sign(nonce.as_bytes()).to_bytes()),
                        directory: "/etc/choria".into(),
                    };
                    return Ok(vec![RpcReply::ok(identity, serde_json::to_value(reply)?)]);
                }
            }

            match self.replies.get(action) {
                Some(reply) => Ok(vec![RpcReply::ok(identity, reply.clone())]),
                None => Ok(vec![]),
            }
        }
    }

    struct FixedHelper(HelperResponse);

    #[async_trait]
    impl ConfigHelper for FixedHelper {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn resolve(&self, _input: &str, _cancel: &CancellationToken) -> Result<HelperResponse> {
            Ok(self.0.clone())
        }
    }

    fn config() -> ProvisionerConfig {
        let mut config = ProvisionerConfig {
            helper: "/bin/true".into(),
            token: "s3cret".into(),
            ..Default::default()
        };
        config.finalize().unwrap();
        config
    }

    fn configured() -> HelperResponse {
        let mut configuration = HashMap::new();
        configuration.insert("identity".to_string(), "n1.example.net".to_string());
        HelperResponse {
            configuration,
            ..Default::default()
        }
    }

    fn context(config: ProvisionerConfig, agent: Arc<ScriptedAgent>, reply: HelperResponse) -> HostContext {
        let metrics = Arc::new(FleetMetrics::new("test"));
        HostContext::new(
            Arc::new(config),
            Arc::new(PauseGate::new(metrics.clone())),
            metrics,
            agent,
            Arc::new(FixedHelper(reply)),
        )
        .with_retry_base(Duration::from_millis(1))
    }

    fn basic_agent() -> ScriptedAgent {
        ScriptedAgent::default()
            .with("inventory", json!({"facts": {"os": "linux"}, "version": "0.28.0", "upgradable": true}))
            .with("configure", json!({"message": "configured"}))
            .with("restart", json!({"message": "restarting"}))
            .with("shutdown", json!({"message": "shutting down"}))
            .with("release_update", json!({"message": "updating"}))
    }

    #[tokio::test]
    async fn test_basic_provision() {
        let agent = Arc::new(basic_agent());
        let ctx = context(config(), agent.clone(), configured());
        let host = Host::new("n1.example.net");

        assert!(host.provision(&ctx, &CancellationToken::new()).await.unwrap());
        assert_eq!(agent.calls(), vec!["inventory", "configure", "restart"]);

        let configure = agent.data_of("configure").unwrap();
        assert_eq!(configure["token"], "s3cret");
        assert_eq!(configure["configuration"], "{\"identity\":\"n1.example.net\"}");

        let state = host.state().await;
        assert!(state.provisioned);
        assert_eq!(state.version, "0.28.0");

        // already provisioned hosts are not contacted again
        assert!(host.provision(&ctx, &CancellationToken::new()).await.unwrap());
        assert_eq!(agent.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_defer() {
        let agent = Arc::new(basic_agent());
        let reply = HelperResponse {
            defer: true,
            msg: "waiting".into(),
            ..Default::default()
        };
        let ctx = context(config(), agent.clone(), reply);
        let host = Host::new("n1.example.net");

        let err = host.provision(&ctx, &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_deferred());
        assert!(err.to_string().contains("waiting"));
        assert_eq!(agent.calls(), vec!["inventory"]);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let agent = Arc::new(basic_agent());
        let reply = HelperResponse {
            shutdown: true,
            ..Default::default()
        };
        let ctx = context(config(), agent.clone(), reply);
        let host = Host::new("n1.example.net");

        assert!(host.provision(&ctx, &CancellationToken::new()).await.unwrap());
        assert_eq!(agent.calls(), vec!["inventory", "shutdown"]);
        assert!(host.state().await.provisioned);
    }

    #[tokio::test]
    async fn test_empty_configuration() {
        let agent = Arc::new(basic_agent());
        let ctx = context(config(), agent.clone(), HelperResponse::default());
        let host = Host::new("n1.example.net");

        let err = host.provision(&ctx, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "could not configure for n1.example.net: empty configuration"
        );
    }

    #[tokio::test]
    async fn test_missing_reply_names_step() {
        let agent = Arc::new(ScriptedAgent::default());
        let ctx = context(config(), agent.clone(), configured());
        let host = Host::new("n1.example.net");

        let err = host.provision(&ctx, &CancellationToken::new()).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("could not fetch inventory for n1.example.net"));
        assert!(msg.contains("received 0 responses"));
        assert_eq!(agent.calls().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_host() {
        let agent = Arc::new(basic_agent());
        let ctx = context(config(), agent.clone(), configured());
        let host = Host::new("n1.example.net");

        tokio::time::advance(Duration::from_secs(601)).await;

        let err = host.provision(&ctx, &CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().starts_with("skipping node that's been waiting"));
        assert!(agent.calls().is_empty());
    }

    #[tokio::test]
    async fn test_paused() {
        let agent = Arc::new(basic_agent());
        let ctx = context(config(), agent.clone(), configured());
        ctx.gate.pause();
        let host = Host::new("n1.example.net");

        let err = host.provision(&ctx, &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_paused());
        assert!(agent.calls().is_empty());
    }

    #[tokio::test]
    async fn test_ed25519_flow() {
        let node_key = SigningKey::generate(&mut OsRng);
        let issuer = SigningKey::generate(&mut OsRng);

        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut key_file, hex::encode(issuer.to_bytes()).as_bytes()).unwrap();

        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::EdDSA),
            &ProvisioningClaims {
                purpose: tokens::PROVISIONING_PURPOSE.into(),
                ..Default::default()
            },
            &jsonwebtoken::EncodingKey::from_ed_der(
                ed25519_dalek::pkcs8::EncodePrivateKey::to_pkcs8_der(&issuer)
                    .unwrap()
                    .as_bytes(),
            ),
        )
        .unwrap();

        let (_, node_dh) = crypto::ecdh_key_pair();
        let mut agent = basic_agent().with(
            "jwt",
            serde_json::to_value(JwtReply {
                jwt: token,
                ecdh_public: hex::encode(node_dh.as_bytes()),
            })
            .unwrap(),
        );
        agent.signer = Some(node_key.clone());
        let agent = Arc::new(agent);

        let mut config = config();
        config.features.ed25519 = true;
        config.jwt_verify_cert = hex::encode(issuer.verifying_key().as_bytes());
        config.jwt_signing_key = key_file.path().display().to_string();
        config.finalize().unwrap();

        let mut reply = configured();
        reply.key = rcgen::KeyPair::generate().unwrap().serialize_pem();

        let ctx = context(config, agent.clone(), reply);
        let host = Host::new("n1.example.net");

        assert!(host.provision(&ctx, &CancellationToken::new()).await.unwrap());
        assert_eq!(
            agent.calls(),
            vec!["jwt", "gen25519", "inventory", "configure", "restart"]
        );

        let state = host.state().await;
        assert_eq!(
            state.ed25519_pubkey.as_ref().unwrap().public_key,
            hex::encode(node_key.verifying_key().as_bytes())
        );
        assert!(!state.signed_server_jwt.is_empty());
        assert!(state.key.contains("Proc-Type: 4,ENCRYPTED"));

        let input = serde_json::to_value(&state).unwrap();
        assert_eq!(input["ed25519_pubkey"]["directory"], "/etc/choria");
        assert_eq!(input["ed25519_pubkey"]["signature"].as_str().unwrap().len(), 128);

        let configure = agent.data_of("configure").unwrap();
        assert_eq!(configure["server_jwt"], state.signed_server_jwt.as_str());
        assert_eq!(configure["ecdh_public"], state.provisioner_ecdh_public.as_str());
    }

    #[tokio::test]
    async fn test_upgrade_requeues() {
        let agent = Arc::new(basic_agent());
        let mut config = config();
        config.features.version_upgrades = true;
        config.upgrades_repo = "https://repo.example.net".into();

        let mut reply = configured();
        reply.upgrade = "0.29.0".into();

        let ctx = context(config, agent.clone(), reply);
        let host = Host::new("n1.example.net");

        assert!(!host.provision(&ctx, &CancellationToken::new()).await.unwrap());
        assert_eq!(agent.calls(), vec!["inventory", "release_update"]);

        let update = agent.data_of("release_update").unwrap();
        assert_eq!(update["repo"], "https://repo.example.net");
        assert_eq!(update["version"], "0.29.0");
        assert!(!host.state().await.provisioned);
    }

    #[tokio::test]
    async fn test_upgrade_not_needed() {
        let agent = Arc::new(basic_agent());
        let mut config = config();
        config.features.version_upgrades = true;
        config.upgrades_repo = "https://repo.example.net".into();

        let mut reply = configured();
        reply.upgrade = "0.28.0".into();

        let ctx = context(config, agent.clone(), reply);
        let host = Host::new("n1.example.net");

        assert!(host.provision(&ctx, &CancellationToken::new()).await.unwrap());
        assert_eq!(agent.calls(), vec!["inventory", "configure", "restart"]);
    }

    #[tokio::test]
    async fn test_optional_upgrade_failure() {
        let agent = Arc::new(
            ScriptedAgent::default()
                .with("inventory", json!({"facts": {}, "version": "0.28.0", "upgradable": false}))
                .with("configure", json!({"message": "configured"}))
                .with("restart", json!({"message": "restarting"})),
        );
        let mut config = config();
        config.features.version_upgrades = true;
        config.upgrades_repo = "https://repo.example.net".into();

        let mut reply = configured();
        reply.upgrade = "0.29.0".into();

        let ctx = context(config.clone(), agent.clone(), reply.clone());
        let err = Host::new("n1.example.net")
            .provision(&ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not upgradable"));

        config.upgrades_optional = true;
        let ctx = context(config, agent.clone(), reply);
        assert!(Host::new("n1.example.net")
            .provision(&ctx, &CancellationToken::new())
            .await
            .unwrap());
    }

    /// Calendar versions such as `2024.10.1` compared as plain strings
    struct Lexical;

    impl VersionComparator for Lexical {
        fn compare(&self, current: &str, target: &str) -> Result<Ordering> {
            Ok(current.cmp(target))
        }
    }

    #[tokio::test]
    async fn test_custom_version_comparator() {
        let agent = Arc::new(
            basic_agent().with("inventory", json!({"facts": {}, "version": "2024.09", "upgradable": true})),
        );
        let mut config = config();
        config.features.version_upgrades = true;
        config.upgrades_repo = "https://repo.example.net".into();

        let mut reply = configured();
        reply.upgrade = "2024.10".into();

        let ctx = context(config, agent.clone(), reply).with_versions(Arc::new(Lexical));
        let host = Host::new("n1.example.net");

        assert!(!host.provision(&ctx, &CancellationToken::new()).await.unwrap());
        assert_eq!(agent.calls(), vec!["inventory", "release_update"]);
    }

    /// Helper that remembers the input it was given
    struct CapturingHelper {
        input: StdMutex<Option<String>>,
        reply: HelperResponse,
    }

    #[async_trait]
    impl ConfigHelper for CapturingHelper {
        fn name(&self) -> &str {
            "capturing"
        }

        async fn resolve(&self, input: &str, _cancel: &CancellationToken) -> Result<HelperResponse> {
            *self.input.lock().unwrap() = Some(input.to_string());
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn test_helper_input_shape() {
        let agent = Arc::new(basic_agent());
        let helper = Arc::new(CapturingHelper {
            input: StdMutex::new(None),
            reply: configured(),
        });
        let metrics = Arc::new(FleetMetrics::new("test"));
        let ctx = HostContext::new(
            Arc::new(config()),
            Arc::new(PauseGate::new(metrics.clone())),
            metrics,
            agent.clone(),
            helper.clone(),
        )
        .with_retry_base(Duration::from_millis(1));

        let host = Host::new("n1.example.net");
        assert!(host.provision(&ctx, &CancellationToken::new()).await.unwrap());

        let raw = helper.input.lock().unwrap().clone().unwrap();
        let input: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(input["identity"], "n1.example.net");
        assert!(input["csr"].is_null());
        assert!(input["ed25519_pubkey"].is_null());
        assert!(input["jwt"].is_null());

        // helpers decode the inventory themselves, so it is sent as JSON text
        let inventory: Value = serde_json::from_str(input["inventory"].as_str().unwrap()).unwrap();
        assert_eq!(inventory["facts"]["os"], "linux");
        assert_eq!(inventory["version"], "0.28.0");
        assert_eq!(inventory["upgradable"], true);
        assert_eq!(host.state().await.inventory, input["inventory"].as_str().unwrap());
    }
}
