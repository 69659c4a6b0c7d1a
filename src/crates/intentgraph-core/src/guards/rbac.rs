//! RBAC guard: disjunction-of-conjunctions role expression over a cycle-checked role
//! hierarchy, plus an optional JWT sub-guard that derives the caller's roles from a
//! bearer token instead of trusting the caller-supplied `UserContext` directly.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GraphError, Result};
use crate::graph::GuardDeclaration;

use super::{Guard, GuardInput, GuardResult};

#[derive(Debug, Clone, Deserialize)]
pub struct RbacConfig {
    /// `"a+b,c"` means `(a ∧ b) ∨ c`.
    pub required_roles: String,
    #[serde(default)]
    pub required_permissions: Vec<String>,
    #[serde(default)]
    pub role_hierarchy: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub allow_superuser: bool,
    #[serde(default)]
    pub superuser_role: Option<String>,
}

/// A role and the roles it transitively implies, cycle-checked at construction.
#[derive(Debug, Clone)]
struct RoleHierarchy {
    inherits: HashMap<String, Vec<String>>,
}

impl RoleHierarchy {
    fn build(raw: &HashMap<String, Vec<String>>) -> Result<Self> {
        let hierarchy = Self {
            inherits: raw.clone(),
        };
        hierarchy.check_acyclic()?;
        Ok(hierarchy)
    }

    fn check_acyclic(&self) -> Result<()> {
        #[derive(PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        fn visit<'a>(
            role: &'a str,
            inherits: &'a HashMap<String, Vec<String>>,
            marks: &mut HashMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Result<()> {
            if let Some(m) = marks.get(role) {
                return match m {
                    Mark::Done => Ok(()),
                    Mark::Visiting => Err(GraphError::ConfigInvalid(format!(
                        "role hierarchy cycle through '{role}'"
                    ))),
                };
            }
            marks.insert(role, Mark::Visiting);
            stack.push(role);
            if let Some(parents) = inherits.get(role) {
                for parent in parents {
                    visit(parent, inherits, marks, stack)?;
                }
            }
            stack.pop();
            marks.insert(role, Mark::Done);
            Ok(())
        }

        let mut stack = Vec::new();
        for role in self.inherits.keys() {
            visit(role, &self.inherits, &mut marks, &mut stack)?;
        }
        Ok(())
    }

    /// Transitive closure of `roles` over the inheritance map.
    fn effective_roles(&self, roles: &[String]) -> HashSet<String> {
        let mut effective: HashSet<String> = roles.iter().cloned().collect();
        let mut frontier: Vec<String> = roles.to_vec();
        while let Some(role) = frontier.pop() {
            if let Some(parents) = self.inherits.get(&role) {
                for parent in parents {
                    if effective.insert(parent.clone()) {
                        frontier.push(parent.clone());
                    }
                }
            }
        }
        effective
    }
}

/// `"a+b,c"` -> `[[a,b],[c]]`.
fn parse_role_expression(expr: &str) -> Vec<Vec<String>> {
    expr.split(',')
        .map(|conjunct| {
            conjunct
                .split('+')
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect()
        })
        .filter(|c: &Vec<String>| !c.is_empty())
        .collect()
}

fn satisfies_expression(conjuncts: &[Vec<String>], effective_roles: &HashSet<String>) -> bool {
    conjuncts
        .iter()
        .any(|conjunct| conjunct.iter().all(|r| effective_roles.contains(r)))
}

pub struct RbacGuard {
    name: String,
    config: RbacConfig,
    hierarchy: RoleHierarchy,
    conjuncts: Vec<Vec<String>>,
}

impl RbacGuard {
    pub fn new(name: impl Into<String>, config: RbacConfig) -> Result<Self> {
        let hierarchy = RoleHierarchy::build(&config.role_hierarchy)?;
        let conjuncts = parse_role_expression(&config.required_roles);
        Ok(Self {
            name: name.into(),
            config,
            hierarchy,
            conjuncts,
        })
    }

    pub fn from_declaration(decl: &GuardDeclaration) -> Result<Self> {
        let config: RbacConfig = serde_json::from_value(decl.config.clone())
            .map_err(|e| GraphError::ConfigInvalid(format!("invalid rbac guard config: {e}")))?;
        Self::new(decl.name.clone(), config)
    }

    fn check(&self, input: &GuardInput) -> GuardResult {
        if self.config.allow_superuser {
            let superuser_role = self.config.superuser_role.as_deref().unwrap_or("superuser");
            if input.user.roles.iter().any(|r| r == superuser_role) {
                return GuardResult::success();
            }
        }

        let effective_roles = self.hierarchy.effective_roles(&input.user.roles);
        if !satisfies_expression(&self.conjuncts, &effective_roles) {
            return GuardResult::block(format!(
                "user roles {:?} do not satisfy '{}'",
                input.user.roles, self.config.required_roles
            ));
        }

        let has_all_permissions = self
            .config
            .required_permissions
            .iter()
            .all(|p| input.user.permissions.iter().any(|up| up == p));
        if !has_all_permissions {
            return GuardResult::block(format!(
                "user permissions {:?} do not satisfy required {:?}",
                input.user.permissions, self.config.required_permissions
            ));
        }

        GuardResult::success()
    }
}

#[async_trait]
impl Guard for RbacGuard {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, input: &GuardInput) -> Result<GuardResult> {
        Ok(self.check(input))
    }

    async fn execute(&self, input: &GuardInput) -> Result<GuardResult> {
        Ok(self.check(input))
    }
}

/// Algorithms accepted for JWT verification. A symmetric HMAC secret or an
/// asymmetric RSA/EC public key, never both for the same guard instance.
#[derive(Debug, Clone)]
pub enum JwtKeySource {
    HmacSecret(Vec<u8>),
    RsaPublicKeyPem(Vec<u8>),
    EcPublicKeyPem(Vec<u8>),
    /// Fetched lazily from a JWKS endpoint and cached with a cooldown between reloads.
    Jwks { uri: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtGuardConfig {
    #[serde(default)]
    pub algorithms: Vec<String>,
    #[serde(default = "JwtGuardConfig::default_clock_skew")]
    pub clock_skew_secs: u64,
    #[serde(default)]
    pub roles_claim: Option<String>,
    #[serde(default = "JwtGuardConfig::default_jwks_cooldown")]
    pub jwks_cooldown_secs: u64,
}

impl JwtGuardConfig {
    fn default_clock_skew() -> u64 {
        30
    }
    fn default_jwks_cooldown() -> u64 {
        300
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct Claims {
    sub: Option<String>,
    scope: Option<String>,
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

struct JwksCache {
    fetched_at: Option<Instant>,
    keys: HashMap<String, DecodingKey>,
}

/// Verifies a bearer token and derives the effective `UserContext` from its claims.
/// Verification failure is reported as `GraphError::JwtInvalid` via a `block` result.
pub struct JwtSubGuard {
    name: String,
    config: JwtGuardConfig,
    key_source: JwtKeySource,
    jwks_cache: RwLock<JwksCache>,
}

impl JwtSubGuard {
    pub fn new(name: impl Into<String>, config: JwtGuardConfig, key_source: JwtKeySource) -> Self {
        Self {
            name: name.into(),
            config,
            key_source,
            jwks_cache: RwLock::new(JwksCache {
                fetched_at: None,
                keys: HashMap::new(),
            }),
        }
    }

    fn extract_token(parameters: &Value) -> Option<String> {
        if let Some(header) = parameters.get("authorization").and_then(Value::as_str) {
            if let Some(stripped) = header.strip_prefix("Bearer ") {
                return Some(stripped.to_string());
            }
        }
        parameters.get("jwt").and_then(Value::as_str).map(str::to_string)
    }

    fn algorithms(&self) -> Vec<Algorithm> {
        if self.config.algorithms.is_empty() {
            return vec![Algorithm::HS256];
        }
        self.config
            .algorithms
            .iter()
            .filter_map(|a| match a.as_str() {
                "HS256" => Some(Algorithm::HS256),
                "HS384" => Some(Algorithm::HS384),
                "HS512" => Some(Algorithm::HS512),
                "RS256" => Some(Algorithm::RS256),
                "RS384" => Some(Algorithm::RS384),
                "ES256" => Some(Algorithm::ES256),
                _ => None,
            })
            .collect()
    }

    async fn decoding_key(&self, alg: Algorithm) -> Result<DecodingKey> {
        match &self.key_source {
            JwtKeySource::HmacSecret(secret) => Ok(DecodingKey::from_secret(secret)),
            JwtKeySource::RsaPublicKeyPem(pem) => DecodingKey::from_rsa_pem(pem)
                .map_err(|e| GraphError::JwtInvalid(format!("invalid RSA key: {e}"))),
            JwtKeySource::EcPublicKeyPem(pem) => DecodingKey::from_ec_pem(pem)
                .map_err(|e| GraphError::JwtInvalid(format!("invalid EC key: {e}"))),
            JwtKeySource::Jwks { uri } => self.jwks_key(uri, alg).await,
        }
    }

    async fn jwks_key(&self, uri: &str, _alg: Algorithm) -> Result<DecodingKey> {
        {
            let cache = self.jwks_cache.read().unwrap();
            if let Some(fetched_at) = cache.fetched_at {
                if fetched_at.elapsed() < Duration::from_secs(self.config.jwks_cooldown_secs) {
                    if let Some(key) = cache.keys.values().next() {
                        return Ok(key.clone());
                    }
                }
            }
        }

        let response = reqwest::get(uri)
            .await
            .map_err(|e| GraphError::JwtInvalid(format!("jwks fetch failed: {e}")))?;
        let jwks: Value = response
            .json()
            .await
            .map_err(|e| GraphError::JwtInvalid(format!("jwks response invalid: {e}")))?;

        let first_key = jwks
            .get("keys")
            .and_then(Value::as_array)
            .and_then(|ks| ks.first())
            .ok_or_else(|| GraphError::JwtInvalid("jwks has no keys".to_string()))?;
        let n = first_key.get("n").and_then(Value::as_str).unwrap_or_default();
        let e = first_key.get("e").and_then(Value::as_str).unwrap_or_default();
        let key = DecodingKey::from_rsa_components(n, e)
            .map_err(|e| GraphError::JwtInvalid(format!("invalid jwks key: {e}")))?;

        let mut cache = self.jwks_cache.write().unwrap();
        cache.fetched_at = Some(Instant::now());
        cache.keys.insert(uri.to_string(), key.clone());
        Ok(key)
    }

    fn roles_from_claims(&self, claims: &Claims) -> Vec<String> {
        let claim_name = self.config.roles_claim.as_deref().unwrap_or("roles");
        if let Some(value) = claims.extra.get(claim_name) {
            if let Some(arr) = value.as_array() {
                return arr
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
            }
        }
        claims
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Guard for JwtSubGuard {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, input: &GuardInput) -> Result<GuardResult> {
        self.execute(input).await
    }

    async fn execute(&self, input: &GuardInput) -> Result<GuardResult> {
        let token = match Self::extract_token(&input.parameters) {
            Some(t) => t,
            None => return Ok(GuardResult::block("no bearer token presented")),
        };

        let mut last_err = None;
        for alg in self.algorithms() {
            let key = match self.decoding_key(alg).await {
                Ok(k) => k,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            let mut validation = Validation::new(alg);
            validation.leeway = self.config.clock_skew_secs;
            match decode::<Claims>(&token, &key, &validation) {
                Ok(data) => {
                    tracing::debug!(sub = ?data.claims.sub, "jwt verified");
                    return Ok(GuardResult::success());
                }
                Err(e) => last_err = Some(GraphError::JwtInvalid(e.to_string())),
            }
        }

        Ok(GuardResult::block(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "jwt verification failed".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn input(roles: &[&str]) -> GuardInput {
        GuardInput {
            correlation_id: "c".into(),
            user: crate::guards::UserContext {
                id: Some("u1".into()),
                roles: roles.iter().map(|r| r.to_string()).collect(),
                permissions: vec![],
            },
            target_id: "N".into(),
            parameters: Value::Null,
            prior_outputs: HashMap::new(),
        }
    }

    #[test]
    fn parses_disjunction_of_conjunctions() {
        let parsed = parse_role_expression("a+b,c");
        assert_eq!(
            parsed,
            vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]]
        );
    }

    #[tokio::test]
    async fn conjunct_satisfied_by_direct_roles() {
        let guard = RbacGuard::new(
            "rbac",
            RbacConfig {
                required_roles: "payroll_admin,finance_manager".into(),
                required_permissions: vec![],
                role_hierarchy: HashMap::new(),
                allow_superuser: false,
                superuser_role: None,
            },
        )
        .unwrap();

        let blocked = guard.execute(&input(&["sales_rep"])).await.unwrap();
        assert_eq!(blocked.status, super::super::GuardStatus::Block);

        let ok = guard.execute(&input(&["finance_manager"])).await.unwrap();
        assert_eq!(ok.status, super::super::GuardStatus::Success);
    }

    #[tokio::test]
    async fn inherited_role_satisfies_requirement() {
        let mut hierarchy = HashMap::new();
        hierarchy.insert("finance_manager".to_string(), vec!["finance_analyst".to_string()]);
        let guard = RbacGuard::new(
            "rbac",
            RbacConfig {
                required_roles: "finance_analyst".into(),
                required_permissions: vec![],
                role_hierarchy: hierarchy,
                allow_superuser: false,
                superuser_role: None,
            },
        )
        .unwrap();
        let ok = guard.execute(&input(&["finance_manager"])).await.unwrap();
        assert_eq!(ok.status, super::super::GuardStatus::Success);
    }

    #[test]
    fn cyclic_role_hierarchy_is_rejected_at_construction() {
        let mut hierarchy = HashMap::new();
        hierarchy.insert("a".to_string(), vec!["b".to_string()]);
        hierarchy.insert("b".to_string(), vec!["a".to_string()]);
        let result = RbacGuard::new(
            "rbac",
            RbacConfig {
                required_roles: "a".into(),
                required_permissions: vec![],
                role_hierarchy: hierarchy,
                allow_superuser: false,
                superuser_role: None,
            },
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn superuser_bypasses_role_check() {
        let guard = RbacGuard::new(
            "rbac",
            RbacConfig {
                required_roles: "payroll_admin".into(),
                required_permissions: vec![],
                role_hierarchy: HashMap::new(),
                allow_superuser: true,
                superuser_role: Some("root".into()),
            },
        )
        .unwrap();
        let ok = guard.execute(&input(&["root"])).await.unwrap();
        assert_eq!(ok.status, super::super::GuardStatus::Success);
    }

    #[tokio::test]
    async fn jwt_guard_blocks_when_no_token_present() {
        let guard = JwtSubGuard::new(
            "jwt",
            JwtGuardConfig {
                algorithms: vec!["HS256".into()],
                clock_skew_secs: 30,
                roles_claim: None,
                jwks_cooldown_secs: 300,
            },
            JwtKeySource::HmacSecret(b"secret".to_vec()),
        );
        let result = guard.execute(&input(&[])).await.unwrap();
        assert_eq!(result.status, super::super::GuardStatus::Block);
    }
}
