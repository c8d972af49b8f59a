#[path = "../../src/test_support.rs"]
mod test_support;

#[allow(unused_imports)]
pub use test_support::{catalog_hasher, program, CatalogSimulator};

use fundhist::{
    Entity, EntityVersion, IdentityKey, ReconcileConfig, Reconciler, RunDate, Snapshot,
    SnapshotBuilder,
};

#[allow(dead_code)]
pub fn reconciler() -> Reconciler {
    Reconciler::new(catalog_hasher(), ReconcileConfig::default())
}

#[allow(dead_code)]
pub fn snapshot(date: RunDate, entities: Vec<Entity>) -> Snapshot {
    let mut builder = SnapshotBuilder::new(date);
    builder.extend(entities);
    builder.finish().expect("snapshot without expectation")
}

#[allow(dead_code)]
pub fn key_of(entity: &Entity) -> IdentityKey {
    catalog_hasher().identity_key(entity)
}

#[allow(dead_code)]
pub fn find<'a>(rows: &'a [EntityVersion], entity: &Entity) -> &'a EntityVersion {
    let key = key_of(entity);
    rows.iter()
        .find(|row| row.identity_key == key)
        .unwrap_or_else(|| panic!("no row for {key}"))
}
