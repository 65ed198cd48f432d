//! Entity registration: table names, field mappings, parent links and factories.
//!
//! Each syncable type is described once by an [`EntityConfig`] and
//! registered with a [`Registry`]. The config is type-erased so the engine
//! can work with `dyn SyncableEntity` values from any registered type; the
//! typed closures supplied at build time downcast internally and report a
//! mismatch as an error instead of panicking.

use crate::entity::SyncableEntity;
use crate::error::{SyncError, SyncResult};
use crate::record::RemoteRecord;
use parking_lot::RwLock;
use serde_json::Value;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

type Getter = Arc<dyn Fn(&dyn SyncableEntity) -> Option<Value> + Send + Sync>;
type Setter = Arc<dyn Fn(&mut dyn SyncableEntity, Value) -> bool + Send + Sync>;
type ParentIdFn = Arc<dyn Fn(&dyn SyncableEntity) -> Option<String> + Send + Sync>;
type Factory = Arc<dyn Fn(&RemoteRecord) -> Option<Box<dyn SyncableEntity>> + Send + Sync>;

/// Maps one entity property to one remote column.
#[derive(Clone)]
pub struct FieldMapping {
    column: String,
    getter: Getter,
    setter: Setter,
    encrypted: bool,
    reject_if_empty: bool,
}

impl FieldMapping {
    /// Maps a property of `E` through JSON values.
    ///
    /// ```rust
    /// # use tidesync_core::{FieldMapping, SyncableEntity};
    /// # #[derive(Debug, Clone, Default)]
    /// # struct Task { id: String, version: u64, deleted: bool, updated_at: u64, priority: i64 }
    /// # impl SyncableEntity for Task {
    /// #     fn id(&self) -> &str { &self.id }
    /// #     fn version(&self) -> u64 { self.version }
    /// #     fn set_version(&mut self, v: u64) { self.version = v; }
    /// #     fn is_deleted(&self) -> bool { self.deleted }
    /// #     fn set_deleted(&mut self, d: bool) { self.deleted = d; }
    /// #     fn updated_at(&self) -> u64 { self.updated_at }
    /// #     fn set_updated_at(&mut self, t: u64) { self.updated_at = t; }
    /// # }
    /// let priority = FieldMapping::new(
    ///     "priority",
    ///     |t: &Task| t.priority.into(),
    ///     |t: &mut Task, v| t.priority = v.as_i64().unwrap_or_default(),
    /// );
    /// assert_eq!(priority.column(), "priority");
    /// ```
    pub fn new<E, G, S>(column: impl Into<String>, get: G, set: S) -> Self
    where
        E: SyncableEntity,
        G: Fn(&E) -> Value + Send + Sync + 'static,
        S: Fn(&mut E, Value) + Send + Sync + 'static,
    {
        Self {
            column: column.into(),
            getter: Arc::new(move |entity: &dyn SyncableEntity| {
                entity.downcast_ref::<E>().map(&get)
            }),
            setter: Arc::new(move |entity: &mut dyn SyncableEntity, value: Value| {
                match entity.downcast_mut::<E>() {
                    Some(entity) => {
                        set(entity, value);
                        true
                    }
                    None => false,
                }
            }),
            encrypted: false,
            reject_if_empty: false,
        }
    }

    /// Maps a string property. Null remote values arrive as an empty string;
    /// non-string values arrive as their JSON text.
    pub fn text<E, G, S>(column: impl Into<String>, get: G, set: S) -> Self
    where
        E: SyncableEntity,
        G: Fn(&E) -> String + Send + Sync + 'static,
        S: Fn(&mut E, String) + Send + Sync + 'static,
    {
        Self::new(
            column,
            move |entity: &E| Value::String(get(entity)),
            move |entity: &mut E, value| {
                let text = match value {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                set(entity, text);
            },
        )
    }

    /// Encrypts this column at rest on the server.
    #[must_use]
    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    /// Ignores empty inbound values so a partially-written row can't blank
    /// out local data.
    #[must_use]
    pub fn reject_if_empty(mut self) -> Self {
        self.reject_if_empty = true;
        self
    }

    /// Remote column name.
    #[must_use]
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Whether the column is encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Whether empty inbound values are ignored.
    #[must_use]
    pub fn rejects_empty(&self) -> bool {
        self.reject_if_empty
    }

    /// Reads the property from `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidEntity`] if `entity` is not the mapped type.
    pub fn read(&self, entity: &dyn SyncableEntity) -> SyncResult<Value> {
        (self.getter)(entity).ok_or_else(|| self.type_mismatch(entity))
    }

    /// Writes `value` into `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidEntity`] if `entity` is not the mapped type.
    pub fn write(&self, entity: &mut dyn SyncableEntity, value: Value) -> SyncResult<()> {
        if (self.setter)(entity, value) {
            Ok(())
        } else {
            Err(self.type_mismatch(entity))
        }
    }

    fn type_mismatch(&self, entity: &dyn SyncableEntity) -> SyncError {
        SyncError::invalid_entity(format!(
            "entity {} does not have the type mapped for column {}",
            entity.id(),
            self.column
        ))
    }
}

impl fmt::Debug for FieldMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMapping")
            .field("column", &self.column)
            .field("encrypted", &self.encrypted)
            .field("reject_if_empty", &self.reject_if_empty)
            .finish_non_exhaustive()
    }
}

/// The link from a child type to its parent type.
#[derive(Clone)]
pub struct ParentRelation {
    parent_type: TypeId,
    parent_type_name: &'static str,
    parent_id: ParentIdFn,
}

impl ParentRelation {
    /// The parent's type.
    #[must_use]
    pub fn parent_type(&self) -> TypeId {
        self.parent_type
    }

    /// The parent's type name.
    #[must_use]
    pub fn parent_type_name(&self) -> &'static str {
        self.parent_type_name
    }
}

impl fmt::Debug for ParentRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParentRelation")
            .field("parent_type", &self.parent_type_name)
            .finish_non_exhaustive()
    }
}

/// Everything the engine needs to know about one syncable type.
#[derive(Clone)]
pub struct EntityConfig {
    type_id: TypeId,
    type_name: &'static str,
    table: String,
    fields: Vec<FieldMapping>,
    parent: Option<ParentRelation>,
    factory: Option<Factory>,
}

impl EntityConfig {
    /// Starts building a config for `E` stored in `table`.
    pub fn builder<E: SyncableEntity>(table: impl Into<String>) -> EntityConfigBuilder<E> {
        EntityConfigBuilder {
            table: table.into(),
            fields: Vec::new(),
            parent: None,
            factory: None,
            _marker: PhantomData,
        }
    }

    /// The Rust type this config describes.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The Rust type name, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Remote table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Field mappings, in registration order.
    #[must_use]
    pub fn fields(&self) -> &[FieldMapping] {
        &self.fields
    }

    /// Parent relation, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&ParentRelation> {
        self.parent.as_ref()
    }

    /// Whether remote-only rows can be materialized.
    #[must_use]
    pub fn has_factory(&self) -> bool {
        self.factory.is_some()
    }

    /// Whether any field is encrypted.
    #[must_use]
    pub fn has_encrypted_fields(&self) -> bool {
        self.fields.iter().any(FieldMapping::is_encrypted)
    }

    /// Resolves the parent link of `entity` to `(parent type, parent id)`.
    ///
    /// Returns `None` for root types and for entities with no parent set.
    #[must_use]
    pub fn parent_link(&self, entity: &dyn SyncableEntity) -> Option<(TypeId, String)> {
        let relation = self.parent.as_ref()?;
        let parent_id = (relation.parent_id)(entity)?;
        if parent_id.is_empty() {
            return None;
        }
        Some((relation.parent_type, parent_id))
    }

    /// Creates a blank local instance for a remote-only row.
    ///
    /// Only the identity is established here; callers adopt the remaining
    /// fields from the record afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::FactoryMissing`] if no factory is registered and
    /// [`SyncError::MalformedRecord`] if the factory declined the record.
    pub fn instantiate(&self, record: &RemoteRecord) -> SyncResult<Box<dyn SyncableEntity>> {
        let factory = self.factory.as_ref().ok_or_else(|| SyncError::FactoryMissing {
            table: self.table.clone(),
        })?;
        factory(record).ok_or_else(|| {
            SyncError::malformed(&self.table, "factory could not create an entity from the record")
        })
    }
}

impl fmt::Debug for EntityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityConfig")
            .field("type_name", &self.type_name)
            .field("table", &self.table)
            .field("fields", &self.fields)
            .field("parent", &self.parent)
            .field("has_factory", &self.factory.is_some())
            .finish()
    }
}

/// Builder for [`EntityConfig`].
pub struct EntityConfigBuilder<E> {
    table: String,
    fields: Vec<FieldMapping>,
    parent: Option<ParentRelation>,
    factory: Option<Factory>,
    _marker: PhantomData<fn() -> E>,
}

impl<E: SyncableEntity> EntityConfigBuilder<E> {
    /// Adds a field mapping.
    #[must_use]
    pub fn field(mut self, mapping: FieldMapping) -> Self {
        self.fields.push(mapping);
        self
    }

    /// Declares `P` as the parent type, with `parent_id` extracting the
    /// parent's ID from a child.
    #[must_use]
    pub fn parent<P, F>(mut self, parent_id: F) -> Self
    where
        P: SyncableEntity,
        F: Fn(&E) -> Option<String> + Send + Sync + 'static,
    {
        self.parent = Some(ParentRelation {
            parent_type: TypeId::of::<P>(),
            parent_type_name: type_name::<P>(),
            parent_id: Arc::new(move |entity: &dyn SyncableEntity| {
                entity.downcast_ref::<E>().and_then(&parent_id)
            }),
        });
        self
    }

    /// Registers a factory for materializing remote-only rows.
    ///
    /// The factory receives the raw record and should return an entity with
    /// its ID set; returning `None` rejects the row.
    #[must_use]
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&RemoteRecord) -> Option<E> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(move |record: &RemoteRecord| {
            factory(record).map(|entity| Box::new(entity) as Box<dyn SyncableEntity>)
        }));
        self
    }

    /// Finishes the config.
    #[must_use]
    pub fn build(self) -> EntityConfig {
        EntityConfig {
            type_id: TypeId::of::<E>(),
            type_name: type_name::<E>(),
            table: self.table,
            fields: self.fields,
            parent: self.parent,
            factory: self.factory,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    by_type: HashMap<TypeId, Arc<EntityConfig>>,
    by_table: HashMap<String, TypeId>,
}

/// Type-to-config registry.
///
/// Registration normally happens once at startup; lookups take a read lock.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a config.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::DuplicateRegistration`] if the type or the table
    /// is already registered.
    pub fn register(&self, config: EntityConfig) -> SyncResult<()> {
        let mut inner = self.inner.write();
        if inner.by_type.contains_key(&config.type_id) || inner.by_table.contains_key(&config.table)
        {
            return Err(SyncError::DuplicateRegistration {
                type_name: config.type_name,
                table: config.table,
            });
        }

        tracing::debug!(
            type_name = config.type_name,
            table = %config.table,
            fields = config.fields.len(),
            "registered entity type"
        );
        inner.by_table.insert(config.table.clone(), config.type_id);
        inner.by_type.insert(config.type_id, Arc::new(config));
        Ok(())
    }

    /// Looks up the config for `E`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnregisteredType`] if `E` is not registered.
    pub fn resolve<E: SyncableEntity>(&self) -> SyncResult<Arc<EntityConfig>> {
        self.resolve_type(TypeId::of::<E>(), type_name::<E>())
    }

    /// Looks up a config by type ID.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnregisteredType`] if the type is not registered.
    pub fn resolve_type(
        &self,
        type_id: TypeId,
        type_name: &'static str,
    ) -> SyncResult<Arc<EntityConfig>> {
        self.inner
            .read()
            .by_type
            .get(&type_id)
            .cloned()
            .ok_or(SyncError::UnregisteredType { type_name })
    }

    /// Looks up a config by remote table name.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnregisteredTable`] if no type uses `table`.
    pub fn resolve_table(&self, table: &str) -> SyncResult<Arc<EntityConfig>> {
        let inner = self.inner.read();
        inner
            .by_table
            .get(table)
            .and_then(|type_id| inner.by_type.get(type_id))
            .cloned()
            .ok_or_else(|| SyncError::UnregisteredTable {
                table: table.to_owned(),
            })
    }

    /// Registered table names, sorted.
    #[must_use]
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.inner.read().by_table.keys().cloned().collect();
        tables.sort();
        tables
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().by_type.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("tables", &self.tables())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ID_COLUMN;
    use serde_json::json;

    #[derive(Debug, Clone, Default)]
    struct Shelf {
        id: String,
        version: u64,
        deleted: bool,
        updated_at: u64,
        label: String,
    }

    #[derive(Debug, Clone, Default)]
    struct Book {
        id: String,
        version: u64,
        deleted: bool,
        updated_at: u64,
        shelf_id: Option<String>,
        pages: i64,
    }

    macro_rules! impl_syncable {
        ($ty:ty) => {
            impl SyncableEntity for $ty {
                fn id(&self) -> &str {
                    &self.id
                }
                fn version(&self) -> u64 {
                    self.version
                }
                fn set_version(&mut self, version: u64) {
                    self.version = version;
                }
                fn is_deleted(&self) -> bool {
                    self.deleted
                }
                fn set_deleted(&mut self, deleted: bool) {
                    self.deleted = deleted;
                }
                fn updated_at(&self) -> u64 {
                    self.updated_at
                }
                fn set_updated_at(&mut self, millis: u64) {
                    self.updated_at = millis;
                }
            }
        };
    }

    impl_syncable!(Shelf);
    impl_syncable!(Book);

    fn shelf_config() -> EntityConfig {
        EntityConfig::builder::<Shelf>("shelves")
            .field(
                FieldMapping::text("label", |s: &Shelf| s.label.clone(), |s: &mut Shelf, v| s.label = v)
                    .reject_if_empty(),
            )
            .factory(|record| {
                Some(Shelf {
                    id: record.id()?.to_owned(),
                    ..Shelf::default()
                })
            })
            .build()
    }

    fn book_config() -> EntityConfig {
        EntityConfig::builder::<Book>("books")
            .field(FieldMapping::new(
                "pages",
                |b: &Book| json!(b.pages),
                |b: &mut Book, v| b.pages = v.as_i64().unwrap_or_default(),
            ))
            .parent::<Shelf, _>(|b| b.shelf_id.clone())
            .build()
    }

    #[test]
    fn register_and_resolve() {
        let registry = Registry::new();
        registry.register(shelf_config()).unwrap();
        registry.register(book_config()).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve::<Shelf>().unwrap().table(), "shelves");
        assert_eq!(registry.resolve_table("books").unwrap().type_id(), TypeId::of::<Book>());
        assert_eq!(registry.tables(), vec!["books".to_string(), "shelves".to_string()]);
    }

    #[test]
    fn duplicate_type_or_table_is_rejected() {
        let registry = Registry::new();
        registry.register(shelf_config()).unwrap();

        assert!(matches!(
            registry.register(shelf_config()),
            Err(SyncError::DuplicateRegistration { .. })
        ));

        let same_table = EntityConfig::builder::<Book>("shelves").build();
        assert!(matches!(
            registry.register(same_table),
            Err(SyncError::DuplicateRegistration { .. })
        ));
    }

    #[test]
    fn unknown_lookups_fail() {
        let registry = Registry::new();
        assert!(matches!(
            registry.resolve::<Book>(),
            Err(SyncError::UnregisteredType { .. })
        ));
        assert!(matches!(
            registry.resolve_table("nope"),
            Err(SyncError::UnregisteredTable { .. })
        ));
    }

    #[test]
    fn field_mapping_reads_and_writes() {
        let config = book_config();
        let mapping = &config.fields()[0];
        let mut book = Book {
            id: "b1".into(),
            pages: 120,
            ..Book::default()
        };

        assert_eq!(mapping.read(&book).unwrap(), json!(120));
        mapping.write(&mut book, json!(300)).unwrap();
        assert_eq!(book.pages, 300);
    }

    #[test]
    fn field_mapping_type_mismatch_is_an_error() {
        let config = book_config();
        let mut shelf = Shelf {
            id: "s1".into(),
            ..Shelf::default()
        };
        assert!(matches!(
            config.fields()[0].read(&shelf),
            Err(SyncError::InvalidEntity { .. })
        ));
        assert!(config.fields()[0].write(&mut shelf, json!(1)).is_err());
    }

    #[test]
    fn text_mapping_coerces_values() {
        let config = shelf_config();
        let mapping = &config.fields()[0];
        assert!(mapping.rejects_empty());
        assert!(!mapping.is_encrypted());

        let mut shelf = Shelf::default();
        mapping.write(&mut shelf, Value::Null).unwrap();
        assert_eq!(shelf.label, "");
        mapping.write(&mut shelf, json!(42)).unwrap();
        assert_eq!(shelf.label, "42");
    }

    #[test]
    fn parent_link_resolution() {
        let config = book_config();
        let mut book = Book {
            id: "b1".into(),
            shelf_id: Some("s1".into()),
            ..Book::default()
        };
        assert_eq!(
            config.parent_link(&book),
            Some((TypeId::of::<Shelf>(), "s1".to_string()))
        );

        book.shelf_id = Some(String::new());
        assert_eq!(config.parent_link(&book), None);
        assert_eq!(shelf_config().parent_link(&Shelf::default()), None);
    }

    #[test]
    fn instantiate_uses_factory() {
        let record = RemoteRecord::new().with(ID_COLUMN, "s9");
        let entity = shelf_config().instantiate(&record).unwrap();
        assert_eq!(entity.id(), "s9");

        assert!(matches!(
            book_config().instantiate(&record),
            Err(SyncError::FactoryMissing { .. })
        ));
        assert!(matches!(
            shelf_config().instantiate(&RemoteRecord::new()),
            Err(SyncError::MalformedRecord { .. })
        ));
    }
}
