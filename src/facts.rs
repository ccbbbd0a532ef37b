//! Fact Bag
//!
//! The pool of values known to one query. Lookups walk a breadth-first
//! forest of the facts (object attributes, collection members and enum
//! synonyms are children; closed types are leaves) and are cached per
//! [`FactSearch`]. Adding a fact drops the traversal and every cached miss,
//! so values discovered later become visible; cached hits stay.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::Result;
use crate::models::{DataSource, TypedInstance, TypedValue};
use crate::schema::{Schema, COLLECTION_SUFFIX};

/// Policy for resolving how many matches a lookup may return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactDiscoveryStrategy {
    /// First matching fact held directly in the bag
    TopLevelOnly,
    /// Exactly one match anywhere in the fact forest
    AnyDepthExpectOne,
    /// Exactly one distinct match, after refining and the non-null heuristic
    AnyDepthExpectOneDistinct,
    /// Every match, as a collection
    AnyDepthAllowMany,
}

/// Filter applied to candidate matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactPredicate {
    Any,
    /// Not null, not an empty string
    HasValue,
}

impl FactPredicate {
    pub fn test(&self, instance: &TypedInstance) -> bool {
        match self {
            FactPredicate::Any => true,
            FactPredicate::HasValue => instance.has_value(),
        }
    }
}

/// Tie-breaker applied when several distinct matches remain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefiningPredicate {
    None,
    /// Prefer values whose type is exactly the requested one
    ExactTypeMatch,
}

/// A lookup, and the cache key for its result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FactSearch {
    pub type_name: String,
    pub strategy: FactDiscoveryStrategy,
    pub filter: FactPredicate,
    pub refine: RefiningPredicate,
}

impl FactSearch {
    pub fn new(type_name: impl Into<String>, strategy: FactDiscoveryStrategy) -> Self {
        Self {
            type_name: type_name.into(),
            strategy,
            filter: FactPredicate::Any,
            refine: RefiningPredicate::ExactTypeMatch,
        }
    }

    pub fn with_filter(mut self, filter: FactPredicate) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_refine(mut self, refine: RefiningPredicate) -> Self {
        self.refine = refine;
        self
    }
}

/// Facts known to one query context
#[derive(Debug, Clone)]
pub struct FactBag {
    schema: Arc<Schema>,
    facts: Vec<TypedInstance>,
    tree: Option<Vec<TypedInstance>>,
    cache: HashMap<FactSearch, Option<TypedInstance>>,
}

impl FactBag {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            facts: Vec::new(),
            tree: None,
            cache: HashMap::new(),
        }
    }

    pub fn with_facts(schema: Arc<Schema>, facts: impl IntoIterator<Item = TypedInstance>) -> Self {
        let mut bag = Self::new(schema);
        bag.add_facts(facts);
        bag
    }

    pub fn add_fact(&mut self, fact: TypedInstance) {
        trace!("Adding fact {}", fact);
        self.facts.push(fact);
        self.tree = None;
        self.cache.retain(|_, result| result.is_some());
    }

    pub fn add_facts(&mut self, facts: impl IntoIterator<Item = TypedInstance>) {
        for fact in facts {
            self.add_fact(fact);
        }
    }

    pub fn facts(&self) -> &[TypedInstance] {
        &self.facts
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Every value in the fact forest, breadth first
    pub fn breadth_first(&mut self) -> &[TypedInstance] {
        if self.tree.is_none() {
            self.tree = Some(self.build_tree());
        }
        self.tree.as_deref().unwrap_or_default()
    }

    pub fn breadth_first_filter(
        &mut self,
        predicate: impl Fn(&TypedInstance) -> bool,
    ) -> Vec<TypedInstance> {
        self.breadth_first()
            .iter()
            .filter(|i| predicate(i))
            .cloned()
            .collect()
    }

    pub fn get_fact_or_null(&mut self, search: &FactSearch) -> Option<TypedInstance> {
        if let Some(cached) = self.cache.get(search) {
            return cached.clone();
        }
        let result = self.search(search);
        debug!(
            "Fact search {:?} for {} found {}",
            search.strategy,
            search.type_name,
            result.as_ref().map(|r| r.to_string()).unwrap_or_else(|| "nothing".to_string())
        );
        self.cache.insert(search.clone(), result.clone());
        result
    }

    pub fn has_fact(&mut self, search: &FactSearch) -> bool {
        self.get_fact_or_null(search).is_some()
    }

    // ========== Traversal ==========

    fn build_tree(&self) -> Vec<TypedInstance> {
        let mut result = Vec::new();
        let mut visited_synonyms: HashSet<(String, String)> = HashSet::new();
        let mut queue: VecDeque<TypedInstance> = self.facts.iter().cloned().collect();
        while let Some(instance) = queue.pop_front() {
            let closed = self
                .schema
                .type_named(&instance.type_name)
                .map(|t| t.is_closed())
                .unwrap_or(false);
            if !closed {
                match &instance.value {
                    TypedValue::Object(attributes) => {
                        queue.extend(attributes.values().cloned());
                    }
                    TypedValue::Collection(members) => {
                        queue.extend(members.iter().cloned());
                    }
                    TypedValue::Enum { name, .. } => {
                        visited_synonyms.insert((instance.type_name.clone(), name.clone()));
                        for synonym in self.synonyms_of(&instance) {
                            let TypedValue::Enum { name, .. } = &synonym.value else {
                                continue;
                            };
                            if visited_synonyms.insert((synonym.type_name.clone(), name.clone())) {
                                queue.push_back(synonym);
                            }
                        }
                    }
                    TypedValue::Null | TypedValue::Scalar(_) => {}
                }
            }
            result.push(instance);
        }
        result
    }

    /// Enum values on other enums equivalent to `instance`
    pub fn synonyms_of(&self, instance: &TypedInstance) -> Vec<TypedInstance> {
        let TypedValue::Enum { name, .. } = &instance.value else {
            return Vec::new();
        };
        self.schema
            .enum_synonyms(&instance.type_name, name)
            .into_iter()
            .filter_map(|(type_name, value_name)| {
                let t = self.schema.type_named(&type_name).ok()?;
                let value = t.enum_values.iter().find(|v| v.name == value_name)?;
                Some(TypedInstance {
                    type_name,
                    value: TypedValue::Enum {
                        name: value.name.clone(),
                        value: value.raw_value(),
                    },
                    source: instance.source.clone(),
                })
            })
            .collect()
    }

    // ========== Search ==========

    fn matches_type(&self, instance: &TypedInstance, type_name: &str) -> bool {
        self.schema.is_assignable(&instance.type_name, type_name)
    }

    fn search(&mut self, search: &FactSearch) -> Option<TypedInstance> {
        let type_name = search.type_name.clone();
        let filter = search.filter;
        match search.strategy {
            FactDiscoveryStrategy::TopLevelOnly => self
                .facts
                .iter()
                .find(|f| self.matches_type(f, &type_name) && filter.test(f))
                .cloned(),
            FactDiscoveryStrategy::AnyDepthExpectOne => {
                let matches = self.tree_matches(&type_name, filter);
                if matches.len() == 1 {
                    matches.into_iter().next()
                } else {
                    None
                }
            }
            FactDiscoveryStrategy::AnyDepthExpectOneDistinct => {
                let requested_member = type_name.strip_suffix(COLLECTION_SUFFIX).map(str::to_string);
                let mut result = self.expect_one_distinct(&type_name, filter, search.refine);
                if result.is_none() {
                    if let Some(member) = &requested_member {
                        result = self.expect_one_distinct(member, filter, search.refine);
                    }
                }
                result.map(|r| match &requested_member {
                    Some(member) if !r.is_collection() => {
                        TypedInstance::collection_of(member, vec![r])
                    }
                    _ => r,
                })
            }
            FactDiscoveryStrategy::AnyDepthAllowMany => {
                let member_type = type_name
                    .strip_suffix(COLLECTION_SUFFIX)
                    .unwrap_or(&type_name)
                    .to_string();
                let candidates = self.breadth_first_filter(|_| true);
                let mut members: Vec<TypedInstance> = Vec::new();
                for candidate in candidates {
                    let matched = if self.matches_type(&candidate, &member_type) {
                        vec![candidate]
                    } else if candidate.is_collection()
                        && self.matches_type(&candidate, &format!("{}{}", member_type, COLLECTION_SUFFIX))
                    {
                        candidate.flatten()
                    } else {
                        continue;
                    };
                    for m in matched {
                        if filter.test(&m) && !members.iter().any(|existing| existing.same_value(&m)) {
                            members.push(m);
                        }
                    }
                }
                if members.is_empty() {
                    None
                } else {
                    Some(TypedInstance::collection_of(&member_type, members))
                }
            }
        }
    }

    fn tree_matches(&mut self, type_name: &str, filter: FactPredicate) -> Vec<TypedInstance> {
        let schema = self.schema.clone();
        self.breadth_first_filter(|i| schema.is_assignable(&i.type_name, type_name) && filter.test(i))
    }

    fn expect_one_distinct(
        &mut self,
        type_name: &str,
        filter: FactPredicate,
        refine: RefiningPredicate,
    ) -> Option<TypedInstance> {
        let mut distinct: Vec<TypedInstance> = Vec::new();
        for m in self.tree_matches(type_name, filter) {
            if !distinct.iter().any(|d| d.same_value(&m)) {
                distinct.push(m);
            }
        }
        if distinct.len() <= 1 {
            return distinct.into_iter().next();
        }
        if refine == RefiningPredicate::ExactTypeMatch {
            let exact_name = self.schema.resolve_alias(type_name);
            let exact: Vec<_> = distinct
                .iter()
                .filter(|d| self.schema.resolve_alias(&d.type_name) == exact_name)
                .collect();
            if exact.len() == 1 {
                return Some(exact[0].clone());
            }
        }
        let non_null: Vec<_> = distinct.iter().filter(|d| !d.is_null()).collect();
        if non_null.len() == 1 {
            return Some(non_null[0].clone());
        }
        debug!(
            "Ambiguous facts for {}: {} distinct values",
            type_name,
            distinct.len()
        );
        None
    }
}

// ============================================================================
// Fact documents
// ============================================================================

/// One entry of a facts document: `{"type": "ClientId", "value": "C1"}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactEntry {
    #[serde(rename = "type")]
    pub type_name: String,
    pub value: serde_json::Value,
}

/// Parse a JSON array of fact entries, each sourced `Provided`
pub fn facts_from_json(schema: &Schema, content: &str) -> Result<Vec<TypedInstance>> {
    let entries: Vec<FactEntry> = serde_json::from_str(content)?;
    entries
        .iter()
        .map(|e| TypedInstance::from_json(&e.type_name, &e.value, schema, DataSource::Provided))
        .collect()
}

pub fn load_facts(schema: &Schema, path: &Path) -> Result<Vec<TypedInstance>> {
    let facts = facts_from_json(schema, &std::fs::read_to_string(path)?)?;
    debug!("Loaded {} facts from {:?}", facts.len(), path);
    Ok(facts)
}
