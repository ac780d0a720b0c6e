//! `ElementWalker`: the one depth-first traversal every structural validator
//! (binding, extension, reference) rides instead of re-implementing its own
//! recursive descent.
//!
//! The walker crosses into a new `ElementIndex` whenever an element's
//! declared type resolves to a distinct StructureDefinition (`Quantity`,
//! `CodeableConcept`, a `Reference` target, a promoted contained resource);
//! inline `BackboneElement`/`Element` children stay indexed against the
//! current type and just keep extending `elementPath`. A single tri-state
//! visitor (`Continue` / `Skip` / `Stop`) is called once per node — multiple
//! validators compose by running independent walks (or by a caller
//! dispatching to several checks from one visitor), not by a deep visitor
//! hierarchy.

use ferrum_context::FhirContext;
use ferrum_models::ElementDefinition;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::index::ElementIndex;
use crate::resolver::{is_primitive_type, TypeResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    Skip,
    Stop,
}

/// A single node visited during a walk.
#[derive(Debug, Clone)]
pub struct WalkContext<'a> {
    pub node: &'a Value,
    /// JSON-navigable instance path, e.g. `Patient.name[0].family`.
    pub path: String,
    /// Declared-schema path, e.g. `Patient.name.family` (indices stripped,
    /// choice elements keep their `[x]` suffix).
    pub element_path: String,
    pub element_def: Option<ElementDefinition>,
    pub type_name: Option<String>,
    pub resource_type: Option<String>,
    pub is_choice_type: bool,
    pub choice_type_name: Option<String>,
    pub is_array_item: bool,
    pub array_index: Option<usize>,
    pub depth: usize,
    /// The parent node's `element_path`. A plain string rather than a
    /// pointer/arena index — the chain is informational only, never walked
    /// back up, so there's no cycle risk to guard against.
    pub parent_path: Option<String>,
}

const INLINE_TYPES: &[&str] = &["BackboneElement", "Element"];

pub struct WalkOutcome {
    pub canceled: bool,
}

pub struct ElementWalker<'r, C> {
    resolver: &'r TypeResolver<C>,
}

impl<'r, C: FhirContext> ElementWalker<'r, C> {
    pub fn new(resolver: &'r TypeResolver<C>) -> Self {
        Self { resolver }
    }

    /// Walk `resource` (a resource-shaped JSON object) against `resource_type`'s
    /// own `ElementIndex`, calling `visitor` once per node.
    pub fn walk(
        &self,
        resource: &Value,
        resource_type: &str,
        cancellation: &CancellationToken,
        visitor: &mut dyn FnMut(&WalkContext) -> WalkControl,
    ) -> WalkOutcome {
        let Some((_, index)) = self.resolver.resolve(resource_type) else {
            return WalkOutcome { canceled: false };
        };

        let root_path = index.root_path().to_string();
        let root = WalkContext {
            node: resource,
            path: resource_type.to_string(),
            element_path: root_path.clone(),
            element_def: index.get(&root_path).cloned(),
            type_name: Some(resource_type.to_string()),
            resource_type: Some(resource_type.to_string()),
            is_choice_type: false,
            choice_type_name: None,
            is_array_item: false,
            array_index: None,
            depth: 0,
            parent_path: None,
        };

        if cancellation.is_cancelled() {
            return WalkOutcome { canceled: true };
        }

        match visitor(&root) {
            WalkControl::Stop => return WalkOutcome { canceled: false },
            WalkControl::Skip => return WalkOutcome { canceled: false },
            WalkControl::Continue => {}
        }

        let canceled = self.walk_children(&root, &index, cancellation, visitor);
        WalkOutcome { canceled }
    }

    fn walk_children(
        &self,
        ctx: &WalkContext,
        index: &ElementIndex,
        cancellation: &CancellationToken,
        visitor: &mut dyn FnMut(&WalkContext) -> WalkControl,
    ) -> bool {
        let Some(obj) = ctx.node.as_object() else {
            return false;
        };

        for (key, value) in obj {
            if cancellation.is_cancelled() {
                return true;
            }
            if is_special_key(key) {
                continue;
            }

            let Some((element_def, choice_type)) = index.get_with_typed(&ctx.element_path, key)
            else {
                continue; // unknown element: the Schema step reports this, the walker just skips it
            };

            let is_choice = choice_type.is_some();
            let type_name = choice_type.or_else(|| {
                element_def
                    .types
                    .as_ref()
                    .and_then(|ts| ts.first())
                    .map(|t| t.code.clone())
            });

            if let Value::Array(items) = value {
                for (i, item) in items.iter().enumerate() {
                    let item_path = format!("{}[{}]", format!("{}.{}", ctx.path, key), i);
                    if self.visit_one(
                        ctx,
                        item,
                        item_path,
                        &element_def,
                        type_name.clone(),
                        is_choice,
                        true,
                        Some(i),
                        index,
                        cancellation,
                        visitor,
                    ) {
                        return true;
                    }
                }
            } else {
                let item_path = format!("{}.{}", ctx.path, key);
                if self.visit_one(
                    ctx,
                    value,
                    item_path,
                    &element_def,
                    type_name,
                    is_choice,
                    false,
                    None,
                    index,
                    cancellation,
                    visitor,
                ) {
                    return true;
                }
            }
        }

        false
    }

    #[allow(clippy::too_many_arguments)]
    fn visit_one(
        &self,
        parent: &WalkContext,
        node: &Value,
        path: String,
        element_def: &ElementDefinition,
        type_name: Option<String>,
        is_choice: bool,
        is_array_item: bool,
        array_index: Option<usize>,
        current_index: &ElementIndex,
        cancellation: &CancellationToken,
        visitor: &mut dyn FnMut(&WalkContext) -> WalkControl,
    ) -> bool {
        // Contained-resource promotion: a `Resource`-typed element holding a
        // JSON object with its own `resourceType` switches context entirely.
        if type_name.as_deref() == Some("Resource") {
            if let Some(inner_type) = node.get("resourceType").and_then(|v| v.as_str()) {
                let ctx = WalkContext {
                    node,
                    path: path.clone(),
                    element_path: inner_type.to_string(),
                    element_def: None,
                    type_name: Some(inner_type.to_string()),
                    resource_type: Some(inner_type.to_string()),
                    is_choice_type: false,
                    choice_type_name: None,
                    is_array_item,
                    array_index,
                    depth: parent.depth + 1,
                    parent_path: Some(parent.element_path.clone()),
                };
                if cancellation.is_cancelled() {
                    return true;
                }
                match visitor(&ctx) {
                    WalkControl::Stop => return true,
                    WalkControl::Skip => return false,
                    WalkControl::Continue => {}
                }
                if let Some((_, inner_index)) = self.resolver.resolve(inner_type) {
                    return self.walk_children(&ctx, &inner_index, cancellation, visitor);
                }
                return false;
            }
        }

        let candidate_type = type_name
            .as_deref()
            .filter(|t| !INLINE_TYPES.contains(t) && !is_primitive_type(t));
        let resolves_new_type = candidate_type.and_then(|t| self.resolver.resolve(t));

        if let Some(t) = candidate_type {
            if resolves_new_type.is_none() {
                tracing::debug!(type_name = t, path = %element_def.path, "could not resolve type for walk descent");
            }
        }

        let effective_element_path = match &resolves_new_type {
            Some((_, new_index)) => new_index.root_path().to_string(),
            None => element_def.path.clone(),
        };

        let ctx = WalkContext {
            node,
            path,
            element_path: effective_element_path,
            element_def: Some(element_def.clone()),
            type_name: type_name.clone(),
            resource_type: parent.resource_type.clone(),
            is_choice_type: is_choice,
            choice_type_name: if is_choice { type_name } else { None },
            is_array_item,
            array_index,
            depth: parent.depth + 1,
            parent_path: Some(parent.element_path.clone()),
        };

        if cancellation.is_cancelled() {
            return true;
        }

        match visitor(&ctx) {
            WalkControl::Stop => return true,
            WalkControl::Skip => return false,
            WalkControl::Continue => {}
        }

        match &resolves_new_type {
            Some((_, new_index)) => self.walk_children(&ctx, new_index, cancellation, visitor),
            None => self.walk_children(&ctx, current_index, cancellation, visitor),
        }
    }
}

fn is_special_key(key: &str) -> bool {
    key == "resourceType" || key.starts_with('_')
}
