//! Users and schema mappings. Last writer wins; no locks are taken.

use super::MetaManager;
use polystore_common::{Error, Permission, Result};
use polystore_meta_store::{SchemaMapping, UserMeta};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

impl MetaManager {
    pub(super) fn init_users(&self) -> Result<()> {
        let users = self.records.load_users()?;
        if users.is_empty() {
            let admin = UserMeta::administrator(
                self.config.admin.username.clone(),
                self.config.admin.password.clone(),
            );
            self.records.put_user(&admin)?;
            info!("Seeded administrator account '{}'", admin.username);
            self.cache.put_user(admin);
        }
        for user in users {
            self.cache.put_user(user);
        }
        Ok(())
    }

    pub(super) fn load_schema_mappings(&self) -> Result<()> {
        for (namespace, mapping) in self.records.load_schema_mappings()? {
            self.cache.put_schema_mapping(&namespace, mapping);
        }
        Ok(())
    }

    // ---- Users ----

    pub fn add_user(&self, user: UserMeta) -> bool {
        self.run("add user", || {
            if self.cache.user(&user.username).is_some() {
                return Err(Error::invalid_argument(format!(
                    "user '{}' already exists",
                    user.username
                )));
            }
            self.records.put_user(&user)?;
            self.cache.put_user(user);
            Ok(())
        })
        .is_some()
    }

    pub fn update_user(
        &self,
        username: &str,
        password: Option<String>,
        permissions: Option<BTreeSet<Permission>>,
    ) -> bool {
        self.run("update user", || {
            let mut user = self
                .cache
                .user(username)
                .ok_or_else(|| Error::invalid_argument(format!("no user '{username}'")))?;
            if let Some(password) = password {
                user.password = password;
            }
            if let Some(permissions) = permissions {
                user.permissions = permissions;
            }
            self.records.put_user(&user)?;
            self.cache.put_user(user);
            Ok(())
        })
        .is_some()
    }

    pub fn remove_user(&self, username: &str) -> bool {
        self.run("remove user", || {
            self.records.remove_user(username)?;
            self.cache.remove_user(username);
            Ok(())
        })
        .is_some()
    }

    #[must_use]
    pub fn user(&self, username: &str) -> Option<UserMeta> {
        self.cache.user(username)
    }

    #[must_use]
    pub fn users(&self) -> Vec<UserMeta> {
        self.cache.users()
    }

    // ---- Schema mappings ----

    /// Replace a namespace's mapping; `None` removes it
    pub fn add_or_update_schema_mapping(
        &self,
        namespace: &str,
        items: Option<BTreeMap<String, i64>>,
    ) -> bool {
        self.run("update schema mapping", || {
            match items {
                None => {
                    self.records.remove_schema_mapping(namespace)?;
                    self.cache.remove_schema_mapping(namespace);
                }
                Some(items) => {
                    let version = self
                        .cache
                        .schema_mapping(namespace)
                        .map_or(0, |m| m.version + 1);
                    let mapping = SchemaMapping { version, items };
                    self.records.put_schema_mapping(namespace, &mapping)?;
                    self.cache.put_schema_mapping(namespace, mapping);
                }
            }
            Ok(())
        })
        .is_some()
    }

    /// Set one item of a namespace's mapping; a value of -1 removes it
    pub fn add_or_update_schema_mapping_item(&self, namespace: &str, key: &str, value: i64) -> bool {
        self.run("update schema mapping item", || {
            let mut mapping = self.cache.schema_mapping(namespace).unwrap_or_default();
            if value == -1 {
                mapping.items.remove(key);
            } else {
                mapping.items.insert(key.to_string(), value);
            }
            mapping.version += 1;
            self.records.put_schema_mapping(namespace, &mapping)?;
            self.cache.put_schema_mapping(namespace, mapping);
            Ok(())
        })
        .is_some()
    }

    #[must_use]
    pub fn schema_mapping(&self, namespace: &str) -> Option<SchemaMapping> {
        self.cache.schema_mapping(namespace)
    }

    /// Mapped value of one key, or -1 when absent
    #[must_use]
    pub fn schema_mapping_item(&self, namespace: &str, key: &str) -> i64 {
        self.cache
            .schema_mapping(namespace)
            .and_then(|m| m.items.get(key).copied())
            .unwrap_or(-1)
    }
}
