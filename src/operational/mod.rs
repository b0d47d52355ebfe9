// Operational Composer.
//
// Builds a per-request `OperationalPlan` over every registered `Operational`
// subscription whose provided path could contribute to a read, invokes each
// provider in parent-before-child order, and merges the returned subtrees
// into one composite result. Grounded on `execution/optimizer`'s
// plan-building shape (build a DAG once per request, discard it when the
// read completes) applied to `xpath`'s textual ancestor/descendant test
// instead of a real query planner's cost model — this crate has no query
// optimizer, only a topological sort over a handful of subscriptions.
//
// Each provider invocation is dispatched through the group's
// `EventRecordStore` rather than calling the stored closure directly: one
// event is published and claimed per instance context, with the provider's
// `Ok`/`Err` result translated into the store's verdict.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::{DataTree, GroupId, SessionId};
use crate::error::{CallbackVerdict, EngineError, EngineResult};
use crate::event_store::EventPhase;
use crate::registry::{CallbackKind, OperationalCallbackArgs, Registry, Subscription, SubscriptionKind};
use crate::schema::SchemaContext;
use crate::xpath::{CompiledXPath, PathSegment};

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// A concrete, instance-addressed xpath an operational provider is about to
/// be invoked for, e.g. `/m:c/list[key='a']/state` for a provider
/// registered at `/m:c/list/state`.
#[derive(Debug, Clone)]
struct ProviderContext {
    addressed_path: String,
}

/// The per-request plan: providers ordered so every ancestor runs strictly
/// before its descendants. Built fresh for each read and discarded once the
/// read completes; nothing here outlives `OperationalComposer::read`.
pub struct OperationalPlan {
    ordered: Vec<Arc<Subscription>>,
}

impl OperationalPlan {
    fn build(mut providers: Vec<Arc<Subscription>>) -> Self {
        providers.sort_by_key(|s| (s.xpath.segments.len(), s.id));
        Self { ordered: providers }
    }

    pub fn provider_count(&self) -> usize {
        self.ordered.len()
    }
}

pub struct OperationalComposer {
    registry: Arc<Registry>,
    schema: Arc<dyn SchemaContext>,
}

fn suffix_segments<'a>(full: &'a CompiledXPath, ancestor_len: usize) -> &'a [PathSegment] {
    &full.segments[ancestor_len..]
}

fn join_path(prefix: &str, suffix: &[PathSegment]) -> String {
    let mut path = prefix.to_string();
    for seg in suffix {
        path.push('/');
        path.push_str(&seg.name);
        if let Some(pred) = &seg.predicate {
            path.push('[');
            path.push_str(pred);
            path.push(']');
        }
    }
    path
}

impl OperationalComposer {
    pub fn new(registry: Arc<Registry>, schema: Arc<dyn SchemaContext>) -> Self {
        Self { registry, schema }
    }

    /// Builds the plan for a read against `request_xpath` in `group`: every
    /// `Operational` subscription whose provided path could intersect the
    /// request, ordered ancestor-before-descendant.
    pub fn plan(&self, group: GroupId, request_xpath: &str) -> EngineResult<OperationalPlan> {
        let request = CompiledXPath::compile(request_xpath);
        let all = self.registry.subscriptions_desc(group, SubscriptionKind::Operational)?;
        let matching: Vec<Arc<Subscription>> = all.into_iter().filter(|s| request.could_select_under(&s.xpath)).collect();
        Ok(OperationalPlan::build(matching))
    }

    /// Executes `plan` against `request_xpath`, invoking each provider in
    /// order and merging its result into the composite tree. Returns the
    /// composite subtree rooted at `request_xpath`.
    pub fn read(&self, group: GroupId, session: SessionId, request_xpath: &str, module: &str) -> EngineResult<DataTree> {
        let pump = self.registry.pump(group)?;
        let plan = self.plan(group, request_xpath)?;
        tracing::debug!(group = %group, request_xpath, providers = plan.provider_count(), "operational read plan built");
        let request = CompiledXPath::compile(request_xpath);
        let mut composite = DataTree::Object(serde_json::Map::new());
        // Concrete instance paths a list-node provider resolved to, keyed by
        // that provider's own (unaddressed) raw path — consulted by any
        // descendant whose closest processed ancestor is this provider.
        let mut instances_by_provider: HashMap<String, Vec<String>> = HashMap::new();

        for sub in plan.ordered.iter() {
            // Step 3: conservative redundancy skip.
            if !request.could_select_under(&sub.xpath) {
                tracing::debug!(subscription = %sub.id, path = %sub.xpath.raw, "operational provider skipped by redundancy filter");
                continue;
            }

            let contexts = self.contexts_for(sub, &instances_by_provider);
            if contexts.is_empty() {
                // If a descendant provider's parent instance does not exist
                // after its parent provider ran, the descendant is simply
                // not invoked for that path.
                continue;
            }

            let mut this_provider_instances = Vec::new();
            for ctx in contexts {
                let CallbackKind::Operational(cb) = &sub.callback else {
                    continue;
                };
                self.schema.validate_path(&ctx.addressed_path).map_err(|_| {
                    EngineError::Validation(format!("operational provider {} returned an invalid path", sub.id))
                })?;
                let mut captured: Option<EngineResult<DataTree>> = None;
                let deadline = Instant::now() + DISPATCH_TIMEOUT;
                pump.dispatch_once(sub.id, session, EventPhase::OperRequest, DataTree::Null, deadline, |event_id| {
                    let result = cb(OperationalCallbackArgs {
                        session,
                        request_id: event_id,
                        module,
                        instance_xpath: &ctx.addressed_path,
                        request_xpath,
                    });
                    let verdict = match &result {
                        Ok(_) => CallbackVerdict::Ok,
                        Err(e) => CallbackVerdict::Fail(e.clone()),
                    };
                    captured = Some(result);
                    verdict
                })?;
                let subtree = captured.take().expect("dispatch_once always invokes the closure on the claimed path")?;
                self.schema.validate_subtree(&ctx.addressed_path, &subtree)?;

                if self.schema.is_list_node(&ctx.addressed_path) {
                    let entries = subtree.as_array().cloned().ok_or_else(|| {
                        EngineError::Validation(format!(
                            "operational provider {} is a list node but did not return an array",
                            sub.id
                        ))
                    })?;
                    let list_name = sub.xpath.segments.last().map(|s| s.name.clone()).unwrap_or_default();
                    let list_parent = ctx.addressed_path.trim_end_matches(&format!("/{list_name}"));
                    for entry in &entries {
                        let key = entry
                            .get("@key")
                            .and_then(|v| v.as_str())
                            .ok_or_else(|| EngineError::Validation(format!("list instance from provider {} is missing @key", sub.id)))?;
                        let instance_path = format!("{list_parent}/{list_name}[{key}]");
                        this_provider_instances.push(instance_path.clone());
                        merge_at(&mut composite, &instance_path, entry.clone());
                    }
                } else {
                    merge_at(&mut composite, &ctx.addressed_path, subtree);
                }
            }
            if !this_provider_instances.is_empty() {
                instances_by_provider.insert(sub.xpath.raw.clone(), this_provider_instances);
            }
        }

        let pointer = crate::common::xpath_to_pointer(request_xpath);
        Ok(composite.pointer(&pointer).cloned().unwrap_or(DataTree::Null))
    }

    /// Determines the concrete context(s) under which `sub` should be
    /// invoked: if its closest already-processed ancestor resolved to N
    /// concrete instances, one context per instance (address = instance
    /// path + this provider's own suffix beyond the ancestor); otherwise a
    /// single context addressed by the provider's own literal path.
    fn contexts_for(&self, sub: &Arc<Subscription>, instances_by_provider: &HashMap<String, Vec<String>>) -> Vec<ProviderContext> {
        let mut best_ancestor: Option<(&String, usize)> = None;
        for (ancestor_raw, _) in instances_by_provider.iter() {
            let ancestor = CompiledXPath::compile(ancestor_raw);
            if ancestor.is_strict_ancestor_of(&sub.xpath) {
                let depth = ancestor.segments.len();
                if best_ancestor.map(|(_, d)| depth > d).unwrap_or(true) {
                    best_ancestor = Some((ancestor_raw, depth));
                }
            }
        }
        match best_ancestor {
            Some((ancestor_raw, depth)) => {
                let suffix = suffix_segments(&sub.xpath, depth);
                instances_by_provider[ancestor_raw]
                    .iter()
                    .map(|instance_path| ProviderContext { addressed_path: join_path(instance_path, suffix) })
                    .collect()
            }
            None => vec![ProviderContext { addressed_path: sub.xpath.raw.clone() }],
        }
    }
}

fn merge_at(tree: &mut DataTree, path: &str, value: DataTree) {
    let pointer = crate::common::xpath_to_pointer(path);
    let segments: Vec<&str> = pointer.split('/').filter(|s| !s.is_empty()).collect();
    let mut cursor = tree;
    for segment in &segments[..segments.len().saturating_sub(1)] {
        if !cursor.is_object() {
            *cursor = DataTree::Object(serde_json::Map::new());
        }
        cursor = cursor
            .as_object_mut()
            .unwrap()
            .entry(segment.to_string())
            .or_insert_with(|| DataTree::Object(serde_json::Map::new()));
    }
    if let Some(last) = segments.last() {
        if !cursor.is_object() {
            *cursor = DataTree::Object(serde_json::Map::new());
        }
        cursor.as_object_mut().unwrap().insert(last.to_string(), value);
    }
}
