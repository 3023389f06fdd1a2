use crate::config::{
    ClassificationRule, PromptCategory, PromptTemplate, RuleSet, SegmentTypeConfig, SenderRule,
    SubjectPattern, TrustLevel,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rule store unavailable: {0}")]
    Unavailable(String),
    #[error("no such record: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Callback fired after an administrative write, so an attached cache can
/// invalidate itself instead of waiting out its TTL.
pub type WriteListener = Arc<dyn Fn() + Send + Sync>;

/// Query contract over the persisted rule collections. Persistence
/// technology is the implementor's business; a relational store, a document
/// store, and the in-memory fixture below all satisfy it.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Active classification rules, any order.
    async fn list_active_classification_rules(&self) -> StoreResult<Vec<ClassificationRule>>;

    async fn list_sender_rules(&self) -> StoreResult<Vec<SenderRule>>;

    async fn list_subject_patterns(&self) -> StoreResult<Vec<SubjectPattern>>;

    async fn list_segment_type_configs(&self) -> StoreResult<Vec<SegmentTypeConfig>>;

    async fn list_active_prompt_templates(&self) -> StoreResult<Vec<PromptTemplate>>;

    /// First sender rule whose pattern is a case-insensitive substring of
    /// `address`, scanning most-recently-created rules first.
    async fn find_sender_rule(&self, address: &str) -> StoreResult<Option<SenderRule>> {
        let mut rules = self.list_sender_rules().await?;
        rules.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let address = address.to_lowercase();
        Ok(rules
            .into_iter()
            .find(|r| address.contains(&r.sender_pattern.to_lowercase())))
    }

    async fn get_segment_type_config(&self, name: &str) -> StoreResult<Option<SegmentTypeConfig>> {
        Ok(self
            .list_segment_type_configs()
            .await?
            .into_iter()
            .find(|c| c.name == name))
    }

    /// The single active template for `(category, segment_type)`. If the
    /// single-active invariant has been violated administratively, the
    /// highest version wins and the violation is logged.
    async fn get_active_prompt_template(
        &self,
        category: PromptCategory,
        segment_type: &str,
    ) -> StoreResult<Option<PromptTemplate>> {
        let candidates: Vec<PromptTemplate> = self
            .list_active_prompt_templates()
            .await?
            .into_iter()
            .filter(|t| t.category == category && t.segment_type == segment_type)
            .collect();
        if candidates.len() > 1 {
            log::warn!(
                "{} active prompt templates for ({:?}, {}), preferring highest version",
                candidates.len(),
                category,
                segment_type
            );
        }
        Ok(candidates.into_iter().max_by_key(|t| t.version))
    }

    /// Register a listener fired after every administrative write. Stores
    /// without a write path keep the default no-op.
    fn register_write_listener(&self, _listener: WriteListener) {}
}

/// In-memory `RuleStore` backed by a `RuleSet` document. Serves as the test
/// fixture and as the out-of-the-box store for deployments that load rules
/// from a YAML file.
pub struct MemoryRuleStore {
    inner: RwLock<RuleSet>,
    listeners: Mutex<Vec<WriteListener>>,
}

impl MemoryRuleStore {
    pub fn new(rules: RuleSet) -> Self {
        MemoryRuleStore {
            inner: RwLock::new(rules),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        Ok(Self::new(RuleSet::from_file(path)?))
    }

    fn read(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, RuleSet>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Unavailable("rule set lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, RuleSet>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("rule set lock poisoned".to_string()))
    }

    /// Fire every registered write listener. Called with no locks held.
    fn notify_write(&self) {
        let listeners = match self.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(e) => {
                log::warn!("write listener lock poisoned, recovering: {e}");
                e.into_inner().clone()
            }
        };
        for listener in listeners {
            listener();
        }
    }

    /// Administrative write: add a classification rule.
    pub fn create_classification_rule(&self, rule: ClassificationRule) -> StoreResult<()> {
        {
            let mut rules = self.write()?;
            log::info!("creating classification rule '{}'", rule.name);
            rules.classification_rules.push(rule);
        }
        self.notify_write();
        Ok(())
    }

    pub fn create_sender_rule(&self, rule: SenderRule) -> StoreResult<()> {
        {
            let mut rules = self.write()?;
            rules.sender_rules.push(rule);
        }
        self.notify_write();
        Ok(())
    }

    /// Administrative write: add a new, inactive version of a template.
    /// The version number is one past the highest existing version of the
    /// same name; activation is a separate step.
    pub fn create_template_version(
        &self,
        name: &str,
        category: PromptCategory,
        segment_type: &str,
        prompt: String,
        self_contained: bool,
    ) -> StoreResult<PromptTemplate> {
        let template = {
            let mut rules = self.write()?;
            let next_version = rules
                .prompt_templates
                .iter()
                .filter(|t| t.name == name)
                .map(|t| t.version)
                .max()
                .unwrap_or(0)
                + 1;
            let template = PromptTemplate {
                name: name.to_string(),
                category,
                segment_type: segment_type.to_string(),
                version: next_version,
                prompt,
                is_active: false,
                self_contained,
                created_at: Utc::now(),
            };
            log::info!("created template '{}' version {}", name, next_version);
            rules.prompt_templates.push(template.clone());
            template
        };
        self.notify_write();
        Ok(template)
    }

    /// Administrative write: activate one version of a template, atomically
    /// deactivating all sibling versions of the same name.
    pub fn activate_template(&self, name: &str, version: u32) -> StoreResult<()> {
        {
            let mut rules = self.write()?;
            if !rules
                .prompt_templates
                .iter()
                .any(|t| t.name == name && t.version == version)
            {
                return Err(StoreError::NotFound(format!(
                    "prompt template '{name}' version {version}"
                )));
            }
            for template in rules
                .prompt_templates
                .iter_mut()
                .filter(|t| t.name == name)
            {
                template.is_active = template.version == version;
            }
            log::info!("activated template '{}' version {}", name, version);
        }
        self.notify_write();
        Ok(())
    }

    pub fn list_sender_rules_by_trust(&self, level: TrustLevel) -> StoreResult<Vec<SenderRule>> {
        let rules = self.read()?;
        Ok(rules
            .sender_rules
            .iter()
            .filter(|r| r.trust_level == level)
            .cloned()
            .collect())
    }

    /// Active subject patterns for one booking type, in load order.
    pub fn find_subject_patterns(&self, email_type: &str) -> StoreResult<Vec<SubjectPattern>> {
        let rules = self.read()?;
        Ok(rules
            .subject_patterns
            .iter()
            .filter(|p| p.is_active && p.email_type == email_type)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn list_active_classification_rules(&self) -> StoreResult<Vec<ClassificationRule>> {
        let rules = self.read()?;
        Ok(rules
            .classification_rules
            .iter()
            .filter(|r| r.is_active)
            .cloned()
            .collect())
    }

    async fn list_sender_rules(&self) -> StoreResult<Vec<SenderRule>> {
        Ok(self.read()?.sender_rules.clone())
    }

    async fn list_subject_patterns(&self) -> StoreResult<Vec<SubjectPattern>> {
        let rules = self.read()?;
        Ok(rules
            .subject_patterns
            .iter()
            .filter(|p| p.is_active)
            .cloned()
            .collect())
    }

    async fn list_segment_type_configs(&self) -> StoreResult<Vec<SegmentTypeConfig>> {
        let rules = self.read()?;
        Ok(rules
            .segment_types
            .iter()
            .filter(|c| c.is_active)
            .cloned()
            .collect())
    }

    async fn list_active_prompt_templates(&self) -> StoreResult<Vec<PromptTemplate>> {
        let rules = self.read()?;
        Ok(rules
            .prompt_templates
            .iter()
            .filter(|t| t.is_active)
            .cloned()
            .collect())
    }

    fn register_write_listener(&self, listener: WriteListener) {
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.push(listener),
            Err(e) => {
                log::warn!("write listener lock poisoned, recovering: {e}");
                e.into_inner().push(listener);
            }
        }
    }
}
