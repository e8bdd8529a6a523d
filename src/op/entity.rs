//! Entity handles and the operations that retrieve them.
//!
//! An [`Entity`] is a live view of one record's tags. The session keeps a
//! weak table of them: as long as the caller holds an `Arc`, repeated
//! retrievals return the same handle with refreshed tags; once the caller
//! drops it, the table slot is pruned on next access.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::core::{OpHandle, ProtocolError};
use crate::grid::{Grid, Meta, Row, Scalar};
use crate::session::SessionInner;

use super::grid::{GridOp, GridPayload};

/// Entities keyed by ID, in retrieval order.
pub type EntityMap = IndexMap<String, Arc<Entity>>;

/// One tagged record.
pub struct Entity {
    id: String,
    tags: RwLock<Meta>,
}

impl Entity {
    fn new(id: String, tags: Meta) -> Self {
        Self {
            id,
            tags: RwLock::new(tags),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display string: the `dis` tag, falling back to the ID.
    pub fn dis(&self) -> String {
        match self.get_tag("dis") {
            Some(Scalar::Str(dis)) => dis,
            _ => self.id.clone(),
        }
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.read().contains_key(name)
    }

    pub fn get_tag(&self, name: &str) -> Option<Scalar> {
        self.tags.read().get(name).cloned()
    }

    /// Snapshot of all tags.
    pub fn tags(&self) -> Meta {
        self.tags.read().clone()
    }

    /// Set a tag locally. This does not write to the server.
    pub fn set_tag(&self, name: impl Into<String>, value: Scalar) {
        self.tags.write().insert(name.into(), value);
    }

    /// Remove a tag locally, returning its previous value.
    pub fn delete_tag(&self, name: &str) -> Option<Scalar> {
        self.tags.write().shift_remove(name)
    }

    /// Replace the tag set from a freshly-read grid row.
    fn refresh_from(&self, row: &Row) {
        let mut tags: Meta = row.clone();
        tags.shift_remove("id");
        *self.tags.write() = tags;
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("tags", &self.tags.read().len())
            .finish()
    }
}

/// The ID carried in a grid row, if any.
fn row_id(row: &Row) -> Option<&str> {
    match row.get("id") {
        Some(Scalar::Ref(id, _)) => Some(id),
        _ => None,
    }
}

/// Fold a grid of entity rows into live handles, reusing and refreshing
/// table entries.
fn absorb_grid(session: &SessionInner, grid: &Grid) -> EntityMap {
    let mut entities = EntityMap::new();
    for row in grid.rows() {
        let Some(id) = row_id(row) else { continue };
        let entity = match session.cached_entity(id) {
            Some(entity) => {
                entity.refresh_from(row);
                entity
            }
            None => {
                let mut tags: Meta = row.clone();
                tags.shift_remove("id");
                let entity = Arc::new(Entity::new(id.to_string(), tags));
                session.store_entity(&entity);
                entity
            }
        };
        entities.insert(id.to_string(), entity);
    }
    entities
}

/// Retrieve entities by ID, serving from the entity table unless `refresh`.
pub(crate) fn spawn_get(
    session: Arc<SessionInner>,
    ids: Vec<String>,
    refresh: bool,
) -> OpHandle<EntityMap> {
    let handle = OpHandle::new();
    let driver_handle = handle.clone();
    tokio::spawn(async move {
        let mut found = EntityMap::new();
        let mut missing: Vec<String> = Vec::new();
        for id in ids {
            match (!refresh).then(|| session.cached_entity(&id)).flatten() {
                Some(entity) => {
                    found.insert(id, entity);
                }
                None => missing.push(id),
            }
        }

        if missing.is_empty() {
            tracing::debug!(count = found.len(), "all entities served from the table");
            driver_handle.complete(Ok(found));
            return;
        }

        let read = read_ids_op(Arc::clone(&session), &missing).spawn();
        read.done().await;
        let result = read
            .result()
            .and_then(GridPayload::into_single)
            .map(|grid| {
                found.extend(absorb_grid(&session, &grid));
                found
            });
        driver_handle.complete(result);
    });
    handle
}

/// Retrieve one entity by ID.
pub(crate) fn spawn_get_single(
    session: Arc<SessionInner>,
    id: String,
    refresh: bool,
) -> OpHandle<Arc<Entity>> {
    let wanted = id.clone();
    spawn_get(session, vec![id], refresh).map(move |res| {
        res.and_then(|entities| {
            entities
                .get(&wanted)
                .cloned()
                .ok_or_else(|| ProtocolError::NotFound.into())
        })
    })
}

/// Retrieve entities matching a filter expression.
pub(crate) fn spawn_find(
    session: Arc<SessionInner>,
    filter: String,
    limit: Option<usize>,
) -> OpHandle<EntityMap> {
    let handle = OpHandle::new();
    let driver_handle = handle.clone();
    tokio::spawn(async move {
        let mut args = vec![("filter".to_string(), filter)];
        if let Some(limit) = limit {
            args.push(("limit".to_string(), Scalar::num(limit as f64).to_zinc()));
        }
        let read = GridOp::get(Arc::clone(&session), "read", args).cached().spawn();
        read.done().await;
        let result = read
            .result()
            .and_then(GridPayload::into_single)
            .map(|grid| absorb_grid(&session, &grid));
        driver_handle.complete(result);
    });
    handle
}

fn read_ids_op(session: Arc<SessionInner>, ids: &[String]) -> GridOp {
    match ids {
        [id] => GridOp::get(
            session,
            "read",
            vec![("id".to_string(), Scalar::make_ref(id.clone()).to_zinc())],
        )
        .cached(),
        ids => {
            let mut grid = Grid::new();
            grid.add_column("id");
            for id in ids {
                let mut row = Row::new();
                row.insert("id".to_string(), Scalar::make_ref(id.clone()));
                grid.push_row(row);
            }
            GridOp::post(session, "read", grid)
        }
    }
}
