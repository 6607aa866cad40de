//! Shared fakes for integration tests: a recording origin, a counting lock
//! service, a recording blacklist and an RSA token signer.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gateway_auth::keys::PublicKey;
use gateway_auth::origin::OriginClient;
use gateway_auth::store::{Blacklist, InMemoryLockService, LockService};
use gateway_auth::token::TokenPair;
use gateway_auth::{Error, Result};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use permission_model::{EndpointPermission, PermissionHash, PermissionSpec};
use serde_json::{Value, json};

pub const PRIVATE_PEM: &[u8] = include_bytes!("../fixtures/rsa_private.pem");
pub const MODULUS: &str = include_str!("../fixtures/rsa_modulus.txt");

/// Public half of the fixture key under `kid`
pub fn fixture_key(kid: &str) -> PublicKey {
    PublicKey {
        kid: kid.to_string(),
        n: MODULUS.trim().to_string(),
        e: "AQAB".to_string(),
        kty: "RSA".to_string(),
        alg: Some("RS256".to_string()),
    }
}

/// Sign `claims` with the fixture key
pub fn sign(kid: &str, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(PRIVATE_PEM).unwrap();
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}

/// Access token for `user` in `tenant` expiring at `exp`
pub fn access_token(kid: &str, tenant: &str, user: &str, exp: DateTime<Utc>, hash: &str) -> String {
    sign(
        kid,
        &json!({
            "sub": user,
            "iss": "origin",
            "exp": exp.timestamp(),
            "iat": (exp - chrono::Duration::minutes(15)).timestamp(),
            "tenantId": tenant,
            "permissionHash": hash,
        }),
    )
}

pub fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

pub fn sample_spec() -> PermissionSpec {
    PermissionSpec {
        version: 7,
        updated_at: Utc::now(),
        endpoints: vec![
            EndpointPermission::new("orders", "/orders", "GET").with_permissions(["orders:read"]),
            EndpointPermission::new("orders", "/orders/{id}", "DELETE")
                .with_permissions(["orders:read", "orders:delete"])
                .with_roles(["admin", "support"]),
            EndpointPermission::new("catalog", "/catalog/**", "GET").public(),
        ],
    }
}

pub fn digest(hash: &str, permissions: &[&str], roles: &[&str]) -> PermissionHash {
    PermissionHash {
        hash: hash.to_string(),
        permissions: set(permissions),
        roles: set(roles),
        generated_at: Utc::now(),
    }
}

/// What the fake origin answers to a refresh exchange
pub enum RefreshReply {
    /// Issue a pair whose access token is signed by the fixture key
    Issue { kid: String, exp: DateTime<Utc> },
    Fail,
}

/// Origin fake that records every call
pub struct FakeOrigin {
    pub keys: Mutex<Vec<PublicKey>>,
    pub spec: Mutex<Option<PermissionSpec>>,
    pub digests: Mutex<HashMap<(String, String), PermissionHash>>,
    pub refresh_reply: Mutex<RefreshReply>,
    pub keys_fail: Mutex<bool>,
    /// Latency of key-set fetches; the set is read before the wait
    pub key_delay: Mutex<Duration>,
    /// Latency of refresh exchanges
    pub refresh_delay: Mutex<Duration>,
    pub key_calls: AtomicUsize,
    pub spec_calls: AtomicUsize,
    pub digest_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub refreshed_tokens: Mutex<Vec<String>>,
    pub issued: AtomicUsize,
}

impl FakeOrigin {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(vec![fixture_key("k1")]),
            spec: Mutex::new(Some(sample_spec())),
            digests: Mutex::new(HashMap::new()),
            refresh_reply: Mutex::new(RefreshReply::Fail),
            keys_fail: Mutex::new(false),
            key_delay: Mutex::new(Duration::ZERO),
            refresh_delay: Mutex::new(Duration::ZERO),
            key_calls: AtomicUsize::new(0),
            spec_calls: AtomicUsize::new(0),
            digest_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            refreshed_tokens: Mutex::new(Vec::new()),
            issued: AtomicUsize::new(0),
        }
    }

    pub fn with_keys(self, kids: &[&str]) -> Self {
        *self.keys.lock() = kids.iter().map(|kid| fixture_key(kid)).collect();
        self
    }

    pub fn with_digest(self, tenant: &str, user: &str, digest: PermissionHash) -> Self {
        self.digests
            .lock()
            .insert((tenant.to_string(), user.to_string()), digest);
        self
    }

    pub fn issuing(self, kid: &str, exp: DateTime<Utc>) -> Self {
        *self.refresh_reply.lock() = RefreshReply::Issue {
            kid: kid.to_string(),
            exp,
        };
        self
    }

    pub fn with_key_delay(self, delay: Duration) -> Self {
        *self.key_delay.lock() = delay;
        self
    }

    pub fn with_refresh_delay(self, delay: Duration) -> Self {
        *self.refresh_delay.lock() = delay;
        self
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl OriginClient for FakeOrigin {
    async fn list_active_keys(&self) -> Result<Vec<PublicKey>> {
        self.key_calls.fetch_add(1, Ordering::SeqCst);
        if *self.keys_fail.lock() {
            return Err(Error::Origin("origin unavailable".to_string()));
        }
        let keys = self.keys.lock().clone();
        let delay = *self.key_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(keys)
    }

    async fn fetch_permission_spec(&self) -> Result<PermissionSpec> {
        self.spec_calls.fetch_add(1, Ordering::SeqCst);
        self.spec
            .lock()
            .clone()
            .ok_or_else(|| Error::Origin("no spec".to_string()))
    }

    async fn fetch_user_permissions(&self, tenant_id: &str, user_id: &str) -> Result<PermissionHash> {
        self.digest_calls.fetch_add(1, Ordering::SeqCst);
        self.digests
            .lock()
            .get(&(tenant_id.to_string(), user_id.to_string()))
            .cloned()
            .ok_or_else(|| Error::Origin(format!("unknown user {tenant_id}/{user_id}")))
    }

    async fn refresh_token(&self, tenant_id: &str, refresh_token: &str) -> Result<TokenPair> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refreshed_tokens.lock().push(refresh_token.to_string());
        let delay = *self.refresh_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (kid, exp) = match &*self.refresh_reply.lock() {
            RefreshReply::Issue { kid, exp } => (kid.clone(), *exp),
            RefreshReply::Fail => return Err(Error::Origin("refresh rejected".to_string())),
        };
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        // The user is carried in the refresh token value: "rt-{user}-..."
        let user = refresh_token
            .strip_prefix("rt-")
            .and_then(|rest| rest.split('-').next())
            .unwrap_or("u1");
        Ok(TokenPair {
            access_token: access_token(&kid, tenant_id, user, exp, "h1"),
            refresh_token: format!("rt-{user}-rotated-{n:04}-{}", "x".repeat(32)),
            expires_in: Some(900),
            refresh_expires_in: Some(86_400),
        })
    }
}

/// Lock service that counts successful acquisitions and releases
#[derive(Default)]
pub struct CountingLocks {
    pub inner: InMemoryLockService,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub fail: Mutex<bool>,
}

impl CountingLocks {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LockService for CountingLocks {
    async fn try_acquire(&self, key: &str, lease: Duration) -> Result<bool> {
        if *self.fail.lock() {
            return Err(Error::Store("lock backend down".to_string()));
        }
        let acquired = self.inner.try_acquire(key, lease).await?;
        if acquired {
            self.acquired.fetch_add(1, Ordering::SeqCst);
        }
        Ok(acquired)
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.inner.release(key).await
    }
}

/// Blacklist that remembers every insert
#[derive(Default)]
pub struct RecordingBlacklist {
    pub entries: Mutex<HashMap<String, Duration>>,
    pub inserts: Mutex<Vec<(String, Duration)>>,
    pub fail_inserts: Mutex<bool>,
}

#[async_trait::async_trait]
impl Blacklist for RecordingBlacklist {
    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().contains_key(key))
    }

    async fn insert(&self, key: &str, ttl: Duration) -> Result<()> {
        if *self.fail_inserts.lock() {
            return Err(Error::Store("blacklist unavailable".to_string()));
        }
        self.entries.lock().insert(key.to_string(), ttl);
        self.inserts.lock().push((key.to_string(), ttl));
        Ok(())
    }
}

