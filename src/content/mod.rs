//! Content access layer.
//!
//! One narrow operation per entity and verb, each mapping to exactly one
//! store call. Nothing is cached and nothing spans entities.

use serde_json::{json, Value};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::config::Tables;
use crate::model::ContentKind;
use crate::store::{ContentStore, Query, StoreError};

pub mod model;

pub use model::{
    BlogPost, BlogPostPatch, CaseStudy, CaseStudyPatch, Entity, Featured, PodcastEpisode,
    PodcastEpisodePatch, Project, ProjectPatch, Publishable, Resource, ResourcePatch, Stored,
};

/// Which records a publishable listing may return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Visibility {
    /// Public pages: `published = true` only.
    #[default]
    PublishedOnly,
    /// Admin pages: drafts included.
    All,
}

#[derive(Clone)]
pub struct ContentService {
    store: Arc<dyn ContentStore>,
    tables: Tables,
}

impl std::fmt::Debug for ContentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentService")
            .field("tables", &self.tables)
            .finish_non_exhaustive()
    }
}

impl ContentService {
    pub fn new(store: Arc<dyn ContentStore>, tables: Tables) -> Self {
        Self { store, tables }
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn collection<T: Entity>(&self) -> Collection<'_, T> {
        Collection {
            store: self.store.as_ref(),
            table: self.tables.name(T::KIND),
            _entity: PhantomData,
        }
    }

    pub fn projects(&self) -> Collection<'_, Project> {
        self.collection()
    }

    pub fn case_studies(&self) -> Collection<'_, CaseStudy> {
        self.collection()
    }

    pub fn blog_posts(&self) -> Collection<'_, BlogPost> {
        self.collection()
    }

    pub fn podcast_episodes(&self) -> Collection<'_, PodcastEpisode> {
        self.collection()
    }

    pub fn resources(&self) -> Collection<'_, Resource> {
        self.collection()
    }

    /// Bump the view counter of one record through the store's RPC.
    #[instrument(skip_all, fields(kind = %kind, id = %id))]
    pub async fn increment_views(&self, kind: ContentKind, id: &str) -> Result<(), StoreError> {
        let args = json!({
            "table_name": self.tables.name(kind),
            "record_id": id,
        });
        self.store.rpc("increment_views", args).await?;
        Ok(())
    }

    /// Number of records of `kind`, drafts included.
    pub async fn count(&self, kind: ContentKind) -> Result<usize, StoreError> {
        let query = Query::new().order_desc(kind.order_column());
        let rows = self.store.select(self.tables.name(kind), &query).await?;
        Ok(rows.len())
    }
}

/// Typed handle on one entity table.
pub struct Collection<'a, T> {
    store: &'a dyn ContentStore,
    table: &'a str,
    _entity: PhantomData<T>,
}

fn decode_rows<T: Entity>(rows: Vec<Value>) -> Result<Vec<Stored<T>>, StoreError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(StoreError::from))
        .collect()
}

impl<'a, T: Entity> Collection<'a, T> {
    pub fn table(&self) -> &str {
        self.table
    }

    fn base_query(visibility: Visibility) -> Query {
        let query = Query::new().order_desc(T::KIND.order_column());
        if T::KIND.is_publishable() && visibility == Visibility::PublishedOnly {
            query.eq("published", true)
        } else {
            query
        }
    }

    /// Public listing. Publishable entities only return published records.
    pub async fn list(&self) -> Result<Vec<Stored<T>>, StoreError> {
        self.fetch(Self::base_query(Visibility::PublishedOnly)).await
    }

    /// One record by id, whatever its publication state.
    pub async fn get(&self, id: &str) -> Result<Option<Stored<T>>, StoreError> {
        let mut rows = self.fetch(Query::new().eq("id", id).limit(1)).await?;
        Ok(rows.pop())
    }

    async fn fetch(&self, query: Query) -> Result<Vec<Stored<T>>, StoreError> {
        let rows = self.store.select(self.table, &query).await?;
        decode_rows(rows)
    }

    #[instrument(skip_all, fields(table = self.table))]
    pub async fn create(&self, record: &T) -> Result<Stored<T>, StoreError> {
        let row = self.store.insert(self.table, serde_json::to_value(record)?).await?;
        let stored: Stored<T> = serde_json::from_value(row)?;
        info!(id = %stored.id, "content record created");
        Ok(stored)
    }

    #[instrument(skip_all, fields(table = self.table, id = %id))]
    pub async fn update(&self, id: &str, patch: &T::Patch) -> Result<Stored<T>, StoreError> {
        let changes = serde_json::to_value(patch)?;
        let row = self.store.update(self.table, id, changes).await?;
        Ok(serde_json::from_value(row)?)
    }

    #[instrument(skip_all, fields(table = self.table, id = %id))]
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.store.delete(self.table, id).await?;
        info!("content record deleted");
        Ok(())
    }
}

impl<'a, T: Publishable> Collection<'a, T> {
    /// Listing with an explicit publication filter, for admin views.
    pub async fn list_with(&self, visibility: Visibility) -> Result<Vec<Stored<T>>, StoreError> {
        self.fetch(Self::base_query(visibility)).await
    }
}

impl<'a, T: Featured> Collection<'a, T> {
    /// Featured records, newest first, capped at `T::FEATURED_LIMIT`.
    pub async fn featured(&self) -> Result<Vec<Stored<T>>, StoreError> {
        let query = Self::base_query(Visibility::PublishedOnly)
            .eq("featured", true)
            .limit(T::FEATURED_LIMIT);
        self.fetch(query).await
    }
}

impl<'a> Collection<'a, Project> {
    pub async fn toggle_featured(
        &self,
        project: &Stored<Project>,
    ) -> Result<Stored<Project>, StoreError> {
        let patch = ProjectPatch {
            featured: Some(!project.featured),
            ..Default::default()
        };
        self.update(&project.id, &patch).await
    }
}
