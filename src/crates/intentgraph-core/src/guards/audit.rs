//! Audit guard: never blocks, only emits a structured audit event as its side effect.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::Result;

use super::{Guard, GuardInput, GuardResult};

pub struct AuditGuard {
    name: String,
}

impl AuditGuard {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn emit(&self, input: &GuardInput) {
        let params_digest = hex::encode(&Sha256::digest(input.parameters.to_string().as_bytes())[..8]);
        tracing::info!(
            guard = %self.name,
            correlation_id = %input.correlation_id,
            user_id = ?input.user.id,
            target_id = %input.target_id,
            params_digest = %params_digest,
            "audit"
        );
    }
}

#[async_trait]
impl Guard for AuditGuard {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, _input: &GuardInput) -> Result<GuardResult> {
        Ok(GuardResult::success())
    }

    async fn execute(&self, input: &GuardInput) -> Result<GuardResult> {
        self.emit(input);
        Ok(GuardResult::success())
    }
}
