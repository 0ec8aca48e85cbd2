//! The identity manager and the IAM facade.
//!
//! The manager keeps an O(1) index of identity verifiers, the tenant
//! runtimes behind external OIDC, and the map from OIDC subject to
//! identity name. In a cluster the identity and policy tables are
//! replicated; the manager is rebuilt from an adapter whenever the store
//! applies an operation touching them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use fleetcast_core::{Error, Result};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::access::{Enforcer, Policy};
use crate::identity::{IdentityVerifier, Tenant};
use crate::token::{self, Claims, TokenUse};
use crate::user::User;

/// Source of the current identity table.
pub trait IdentityAdapter: Send + Sync {
    /// Returns all identities.
    fn identities(&self) -> Vec<User>;
}

/// Source of the current policy table.
pub trait PolicyAdapter: Send + Sync {
    /// Returns all policies.
    fn policies(&self) -> Vec<Policy>;
}

struct ManagerState {
    root: Arc<IdentityVerifier>,
    identities: HashMap<String, Arc<IdentityVerifier>>,
    tenants: HashMap<String, Arc<Tenant>>,
    oidc_user_map: HashMap<String, String>,
}

/// Manages identity verifiers and tenants.
pub struct IdentityManager {
    state: RwLock<ManagerState>,
    jwt_realm: String,
    jwt_secret: Vec<u8>,
}

impl IdentityManager {
    /// Creates a manager with the immutable bootstrap superuser.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the superuser record is invalid.
    pub fn new(mut superuser: User, jwt_realm: &str, jwt_secret: &str) -> Result<Self> {
        superuser.superuser = true;
        superuser.validate()?;

        let jwt_secret = jwt_secret.as_bytes().to_vec();

        let mut tenants = HashMap::new();
        let mut oidc_user_map = HashMap::new();
        let root = Self::build_verifier(
            superuser,
            &mut tenants,
            &mut oidc_user_map,
            jwt_realm,
            &jwt_secret,
        )?;

        Ok(Self {
            state: RwLock::new(ManagerState {
                root,
                identities: HashMap::new(),
                tenants,
                oidc_user_map,
            }),
            jwt_realm: jwt_realm.to_string(),
            jwt_secret,
        })
    }

    fn build_verifier(
        user: User,
        tenants: &mut HashMap<String, Arc<Tenant>>,
        oidc_user_map: &mut HashMap<String, String>,
        jwt_realm: &str,
        jwt_secret: &[u8],
    ) -> Result<Arc<IdentityVerifier>> {
        let mut tenant = None;

        if user.auth.api.oidc.enable {
            if oidc_user_map.contains_key(&user.auth.api.oidc.user) {
                return Err(Error::already_exists(
                    "the OIDC user already has an identity",
                ));
            }

            let coordinates = &user.auth.api.oidc.tenant;
            let runtime = match tenants.get(&coordinates.key()) {
                Some(existing) => {
                    existing.add_client_id(&coordinates.client_id);
                    existing.clone()
                }
                None => {
                    let created = Arc::new(Tenant::new(coordinates));
                    tenants.insert(coordinates.key(), created.clone());
                    created
                }
            };

            oidc_user_map.insert(user.auth.api.oidc.user.clone(), user.name.clone());
            tenant = Some(runtime);
        }

        Ok(Arc::new(IdentityVerifier::new(
            user,
            tenant,
            jwt_realm.to_string(),
            jwt_secret.to_vec(),
        )))
    }

    /// Adds an identity.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an invalid record, `AlreadyExists`
    /// for a name or OIDC subject collision.
    pub fn create(&self, user: User) -> Result<()> {
        user.validate()?;

        let mut state = self.state.write();
        let state = &mut *state;

        if state.root.name() == user.name || state.identities.contains_key(&user.name) {
            return Err(Error::already_exists(format!("identity '{}' already exists", user.name)));
        }

        let name = user.name.clone();
        let verifier = Self::build_verifier(
            user,
            &mut state.tenants,
            &mut state.oidc_user_map,
            &self.jwt_realm,
            &self.jwt_secret,
        )?;
        state.identities.insert(name, verifier);

        Ok(())
    }

    /// Replaces an identity, possibly under a new name.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for the superuser, `NotFound` for an unknown
    /// name, `AlreadyExists` on a rename or OIDC subject collision.
    pub fn update(&self, name: &str, user: User) -> Result<()> {
        user.validate()?;

        {
            let state = self.state.read();

            if state.root.name() == name {
                return Err(Error::new(
                    fleetcast_core::ErrorKind::Forbidden,
                    "this identity can't be updated",
                ));
            }
            if !state.identities.contains_key(name) {
                return Err(Error::not_found(format!("identity '{name}'")));
            }
            if name != user.name
                && (state.identities.contains_key(&user.name) || state.root.name() == user.name)
            {
                return Err(Error::already_exists(format!(
                    "identity '{}' already exists",
                    user.name
                )));
            }
            if user.auth.api.oidc.enable {
                if let Some(owner) = state.oidc_user_map.get(&user.auth.api.oidc.user) {
                    if owner != name {
                        return Err(Error::already_exists(
                            "the OIDC user already has an identity",
                        ));
                    }
                }
            }
        }

        self.remove(name)?;
        self.create(user)
    }

    /// Removes an identity. Stale verifier handles fail closed afterward.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for the superuser, `NotFound` for an unknown
    /// name.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();

        if state.root.name() == name {
            return Err(Error::new(
                fleetcast_core::ErrorKind::Forbidden,
                "this identity can't be removed",
            ));
        }

        let Some(identity) = state.identities.remove(name) else {
            return Err(Error::not_found(format!("identity '{name}'")));
        };

        identity.invalidate();

        let user = identity.user();
        if !user.auth.api.oidc.enable {
            return Ok(());
        }

        state.oidc_user_map.remove(&user.auth.api.oidc.user);

        let Some(tenant) = identity.tenant() else {
            return Ok(());
        };

        let tenant_in_use = state
            .identities
            .values()
            .any(|i| i.tenant().is_some_and(|t| Arc::ptr_eq(t, tenant)));

        if !tenant_in_use {
            tenant.cancel();
            state.tenants.remove(&tenant.key());
            return Ok(());
        }

        let client_id = &user.auth.api.oidc.tenant.client_id;
        let client_id_in_use = state.identities.values().any(|i| {
            i.user().auth.api.oidc.enable && &i.user().auth.api.oidc.tenant.client_id == client_id
        });
        if !client_id_in_use {
            tenant.remove_client_id(client_id);
        }

        Ok(())
    }

    /// Returns a copy of an identity record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown name.
    pub fn get(&self, name: &str) -> Result<User> {
        Ok(self.verifier(name)?.user().clone())
    }

    /// Returns the verifier of an identity, including the superuser.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown name.
    pub fn verifier(&self, name: &str) -> Result<Arc<IdentityVerifier>> {
        let state = self.state.read();
        if state.root.name() == name {
            return Ok(state.root.clone());
        }
        state
            .identities
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("identity '{name}'")))
    }

    /// Returns the verifier owning the given external OIDC subject.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no identity maps to the subject.
    pub fn verifier_by_oidc(&self, subject: &str) -> Result<Arc<IdentityVerifier>> {
        let name = {
            let state = self.state.read();
            state
                .oidc_user_map
                .get(subject)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("no identity for subject '{subject}'")))?
        };
        self.verifier(&name)
    }

    /// Returns the superuser verifier.
    #[must_use]
    pub fn default_verifier(&self) -> Arc<IdentityVerifier> {
        self.state.read().root.clone()
    }

    /// Lists all identities, the superuser excluded.
    #[must_use]
    pub fn list(&self) -> Vec<User> {
        self.state.read().identities.values().map(|i| i.user().clone()).collect()
    }

    /// Issues an access and a refresh token for an identity.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown name.
    pub fn create_jwt(&self, name: &str) -> Result<(String, String)> {
        let verifier = self.verifier(name)?;
        let now = Utc::now();

        let access = token::sign(
            &Claims::new(&self.jwt_realm, verifier.name(), TokenUse::Access, now),
            &self.jwt_secret,
        )?;
        let refresh = token::sign(
            &Claims::new(&self.jwt_realm, verifier.name(), TokenUse::Refresh, now),
            &self.jwt_secret,
        )?;

        Ok((access, refresh))
    }

    /// Describes the available login validators.
    #[must_use]
    pub fn validators(&self) -> Vec<String> {
        let mut validators = vec!["localjwt".to_string()];

        let state = self.state.read();
        for tenant in state.tenants.values() {
            for client_id in tenant.client_ids() {
                validators.push(format!(
                    "oidc domain={} audience={} clientid={}",
                    tenant.domain, tenant.audience, client_id
                ));
            }
        }

        validators
    }

    /// Imports a flat `User` list from a JSON file. Missing files are not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed, or if an
    /// imported identity is invalid.
    pub fn load_users_file(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        let data = std::fs::read(path)?;
        let users: Vec<User> = serde_json::from_slice(&data)?;

        for user in users {
            let name = user.name.clone();
            self.create(user)?;
            debug!(name = %name, "imported identity");
        }

        Ok(())
    }

    /// Rebuilds the identity index from the replicated table.
    ///
    /// The superuser stays untouched. Tenants no longer referenced are
    /// cancelled.
    pub fn reload(&self, adapter: &dyn IdentityAdapter) {
        let users = adapter.identities();

        let mut state = self.state.write();
        let state = &mut *state;

        for identity in state.identities.values() {
            identity.invalidate();
        }

        let root_name = state.root.name().to_string();
        let old_tenants = std::mem::take(&mut state.tenants);

        state.identities.clear();
        state.oidc_user_map.clear();

        for user in users {
            if user.name == root_name {
                continue;
            }
            let name = user.name.clone();
            match Self::build_verifier(
                user,
                &mut state.tenants,
                &mut state.oidc_user_map,
                &self.jwt_realm,
                &self.jwt_secret,
            ) {
                Ok(verifier) => {
                    state.identities.insert(name, verifier);
                }
                Err(e) => {
                    debug!(name = %name, error = %e, "skipping identity on reload");
                }
            }
        }

        for (key, tenant) in old_tenants {
            if !state.tenants.contains_key(&key) {
                tenant.cancel();
            }
        }

        info!(identities = state.identities.len(), "reloaded identities");
    }

    #[cfg(test)]
    fn tenant_count(&self) -> usize {
        self.state.read().tenants.len()
    }
}

/// The IAM facade combining identity management and policy enforcement.
pub struct Iam {
    identities: IdentityManager,
    enforcer: Enforcer,
}

impl Iam {
    /// Creates the facade.
    ///
    /// # Errors
    ///
    /// Returns an error if the superuser record is invalid.
    pub fn new(superuser: User, jwt_realm: &str, jwt_secret: &str) -> Result<Self> {
        Ok(Self {
            identities: IdentityManager::new(superuser, jwt_realm, jwt_secret)?,
            enforcer: Enforcer::new(),
        })
    }

    /// Returns the identity manager.
    #[must_use]
    pub fn identities(&self) -> &IdentityManager {
        &self.identities
    }

    /// Returns the policy enforcer.
    #[must_use]
    pub fn enforcer(&self) -> &Enforcer {
        &self.enforcer
    }

    /// Decides whether `name` may perform `action` on `resource` in
    /// `domain`. Superusers bypass the policy check.
    #[must_use]
    pub fn enforce(&self, name: &str, domain: &str, resource: &str, action: &str) -> bool {
        if let Ok(verifier) = self.identities.verifier(name) {
            if verifier.is_superuser() {
                return true;
            }
        }

        self.enforcer.enforce(name, domain, resource, action)
    }

    /// Rebuilds the identity index from the replicated table.
    pub fn reload_identities(&self, adapter: &dyn IdentityAdapter) {
        self.identities.reload(adapter);
    }

    /// Rebuilds the policy index from the replicated table.
    pub fn reload_policies(&self, adapter: &dyn PolicyAdapter) {
        self.enforcer.reload(adapter.policies());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::{OidcTenant, UserAuthPassword};

    fn superuser() -> User {
        User {
            name: "admin".to_string(),
            auth: crate::user::UserAuth {
                api: crate::user::UserAuthApi {
                    userpass: UserAuthPassword { enable: true, password: "root".to_string() },
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn manager() -> IdentityManager {
        IdentityManager::new(superuser(), "fleetcast", "secret").unwrap()
    }

    fn oidc_user(name: &str, subject: &str, client_id: &str) -> User {
        let mut user = User { name: name.to_string(), ..Default::default() };
        user.auth.api.oidc.enable = true;
        user.auth.api.oidc.user = subject.to_string();
        user.auth.api.oidc.tenant = OidcTenant {
            domain: "tenant.example.com".to_string(),
            audience: "aud".to_string(),
            client_id: client_id.to_string(),
        };
        user
    }

    #[test]
    fn test_superuser_is_immutable_and_unlisted() {
        let m = manager();

        assert!(m.list().is_empty());
        assert!(m.verifier("admin").unwrap().is_superuser());

        assert!(m.update("admin", superuser()).is_err());
        assert!(m.remove("admin").is_err());
        assert!(m.create(superuser()).is_err());
    }

    #[test]
    fn test_create_update_remove() {
        let m = manager();

        m.create(User { name: "alice".to_string(), ..Default::default() }).unwrap();
        assert_eq!(m.list().len(), 1);

        // rename
        m.update("alice", User { name: "bob".to_string(), ..Default::default() }).unwrap();
        assert!(m.verifier("alice").is_err());
        assert!(m.verifier("bob").is_ok());

        m.remove("bob").unwrap();
        assert!(m.verifier("bob").is_err());
        assert!(m.remove("bob").is_err());
    }

    #[test]
    fn test_oidc_subject_maps_to_one_identity() {
        let m = manager();

        m.create(oidc_user("alice", "oidc|1", "c1")).unwrap();
        let err = m.create(oidc_user("bob", "oidc|1", "c1")).unwrap_err();
        assert_eq!(err.kind(), fleetcast_core::ErrorKind::AlreadyExists);

        assert_eq!(m.verifier_by_oidc("oidc|1").unwrap().name(), "alice");
        assert!(m.verifier_by_oidc("oidc|2").is_err());
    }

    #[test]
    fn test_tenant_lifecycle() {
        let m = manager();

        m.create(oidc_user("alice", "oidc|1", "c1")).unwrap();
        m.create(oidc_user("bob", "oidc|2", "c1")).unwrap();
        assert_eq!(m.tenant_count(), 1);

        m.remove("alice").unwrap();
        // bob still refers to the tenant
        assert_eq!(m.tenant_count(), 1);

        m.remove("bob").unwrap();
        assert_eq!(m.tenant_count(), 0);
    }

    #[test]
    fn test_create_jwt() {
        let m = manager();
        m.create(User { name: "alice".to_string(), ..Default::default() }).unwrap();

        let (access, refresh) = m.create_jwt("alice").unwrap();
        assert_ne!(access, refresh);

        let verifier = m.verifier("alice").unwrap();
        assert!(verifier.verify_jwt(&access).unwrap());
        assert!(verifier.verify_jwt(&refresh).unwrap());
    }

    #[test]
    fn test_validators() {
        let m = manager();
        m.create(oidc_user("alice", "oidc|1", "c1")).unwrap();

        let validators = m.validators();
        assert!(validators.contains(&"localjwt".to_string()));
        assert!(validators.iter().any(|v| v.contains("clientid=c1")));
    }

    struct StaticAdapter(Vec<User>);

    impl IdentityAdapter for StaticAdapter {
        fn identities(&self) -> Vec<User> {
            self.0.clone()
        }
    }

    struct StaticPolicies(Vec<Policy>);

    impl PolicyAdapter for StaticPolicies {
        fn policies(&self) -> Vec<Policy> {
            self.0.clone()
        }
    }

    #[test]
    fn test_reload_replaces_identities() {
        let m = manager();
        m.create(User { name: "old".to_string(), ..Default::default() }).unwrap();
        let stale = m.verifier("old").unwrap();

        m.reload(&StaticAdapter(vec![User { name: "new".to_string(), ..Default::default() }]));

        assert!(m.verifier("old").is_err());
        assert!(m.verifier("new").is_ok());
        // stale handles fail closed
        assert!(stale.verify_service_token("x").is_err());
        // the superuser survives a reload
        assert!(m.verifier("admin").unwrap().is_superuser());
    }

    #[test]
    fn test_iam_enforce_superuser_bypass() {
        let iam = Iam::new(superuser(), "fleetcast", "secret").unwrap();

        iam.reload_policies(&StaticPolicies(vec![Policy {
            name: "alice".to_string(),
            domain: String::new(),
            resource: "processid:p1".to_string(),
            actions: vec!["read".to_string()],
        }]));

        assert!(iam.enforce("admin", "", "anything:at-all", "write"));
        assert!(iam.enforce("alice", "", "processid:p1", "read"));
        assert!(!iam.enforce("alice", "", "processid:p2", "read"));
    }

    #[test]
    fn test_load_users_file() {
        let dir = std::env::temp_dir().join(format!("fleetcast-iam-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("users.json");
        std::fs::write(
            &path,
            serde_json::to_vec(&vec![
                User { name: "alice".to_string(), ..Default::default() },
                User { name: "bob".to_string(), ..Default::default() },
            ])
            .unwrap(),
        )
        .unwrap();

        let m = manager();
        m.load_users_file(&path).unwrap();
        assert_eq!(m.list().len(), 2);

        // a missing file is fine
        m.load_users_file(&dir.join("absent.json")).unwrap();

        std::fs::remove_dir_all(&dir).ok();
    }
}
