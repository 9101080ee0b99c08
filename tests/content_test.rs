use async_trait::async_trait;
use serde_json::Value;
use std::io;
use std::sync::{Arc, Mutex};

use portfolio_cms::config::Tables;
use portfolio_cms::content::{
    BlogPost, BlogPostPatch, ContentService, PodcastEpisode, Project, ProjectPatch, Resource,
    Visibility,
};
use portfolio_cms::model::ContentKind;
use portfolio_cms::shell::dashboard_stats;
use portfolio_cms::store::{ContentStore, Query, SqliteStore, StoreError};

async fn setup_service() -> ContentService {
    let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
    ContentService::new(Arc::new(store), Tables::default())
}

fn project(title: &str, featured: bool) -> Project {
    Project {
        title: title.into(),
        description: format!("{title} description"),
        category: "web".into(),
        status: "completed".into(),
        tags: vec!["rust".into()],
        featured,
        ..Default::default()
    }
}

fn post(title: &str, published: bool, featured: bool) -> BlogPost {
    BlogPost {
        title: title.into(),
        excerpt: "excerpt".into(),
        content: "body".into(),
        category: "engineering".into(),
        published,
        featured,
        ..Default::default()
    }
}

fn episode(number: i32, published: bool) -> PodcastEpisode {
    PodcastEpisode {
        episode_number: number,
        title: format!("Episode {number}"),
        published,
        ..Default::default()
    }
}

#[tokio::test]
async fn created_project_heads_the_listing() {
    let content = setup_service().await;
    let projects = content.projects();
    projects.create(&project("P0", false)).await.unwrap();

    let created = projects.create(&project("P1", false)).await.unwrap();
    assert!(!created.id.is_empty());
    assert_eq!(created.title, "P1");

    let listed = projects.list().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, created.id);
    assert_eq!(listed[0].title, "P1");
    assert_eq!(listed[1].title, "P0");
}

#[tokio::test]
async fn featured_projects_are_capped_newest_first() {
    let content = setup_service().await;
    let projects = content.projects();
    for i in 0..6 {
        projects
            .create(&project(&format!("F{i}"), true))
            .await
            .unwrap();
    }
    projects.create(&project("plain", false)).await.unwrap();

    let featured = projects.featured().await.unwrap();
    let titles: Vec<&str> = featured.iter().map(|p| p.title.as_str()).collect();
    assert_eq!(titles, vec!["F5", "F4", "F3", "F2"]);
}

#[tokio::test]
async fn blog_listing_hides_drafts_unless_asked() {
    let content = setup_service().await;
    let posts = content.blog_posts();
    posts.create(&post("live", true, false)).await.unwrap();
    posts.create(&post("draft", false, true)).await.unwrap();

    let public = posts.list().await.unwrap();
    assert_eq!(public.len(), 1);
    assert_eq!(public[0].title, "live");

    let all = posts.list_with(Visibility::All).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].title, "draft");

    // A featured draft is not the featured post.
    assert!(posts.featured().await.unwrap().is_empty());
    posts.create(&post("headline", true, true)).await.unwrap();
    let featured = posts.featured().await.unwrap();
    assert_eq!(featured.len(), 1);
    assert_eq!(featured[0].title, "headline");
}

#[tokio::test]
async fn podcast_episodes_order_by_episode_number() {
    let content = setup_service().await;
    let episodes = content.podcast_episodes();
    for (number, published) in [(2, true), (7, true), (1, true), (5, false)] {
        episodes.create(&episode(number, published)).await.unwrap();
    }

    let public = episodes.list().await.unwrap();
    let numbers: Vec<i32> = public.iter().map(|e| e.episode_number).collect();
    assert_eq!(numbers, vec![7, 2, 1]);

    let all = episodes.list_with(Visibility::All).await.unwrap();
    assert_eq!(all[1].episode_number, 5);
}

#[tokio::test]
async fn update_changes_only_patched_fields() {
    let content = setup_service().await;
    let posts = content.blog_posts();
    let created = posts.create(&post("draft", false, false)).await.unwrap();

    let patch = BlogPostPatch {
        published: Some(true),
        ..Default::default()
    };
    let updated = posts.update(&created.id, &patch).await.unwrap();

    assert_eq!(updated.id, created.id);
    assert_eq!(updated.created_at, created.created_at);
    assert!(updated.published);
    assert_eq!(updated.title, "draft");
    assert_eq!(posts.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn update_and_delete_of_missing_id_fail_without_changes() {
    let content = setup_service().await;
    let projects = content.projects();
    projects.create(&project("kept", false)).await.unwrap();

    let patch = ProjectPatch {
        title: Some("changed".into()),
        ..Default::default()
    };
    let err = projects.update("missing", &patch).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));

    let err = projects.delete("missing").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { ref id, .. } if id == "missing"));

    let listed = projects.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].title, "kept");
}

#[tokio::test]
async fn delete_removes_record() {
    let content = setup_service().await;
    let resources = content.resources();
    let created = resources
        .create(&Resource {
            title: "Checklist".into(),
            resource_type: "pdf".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    resources.delete(&created.id).await.unwrap();

    assert!(resources.list().await.unwrap().is_empty());
    assert!(resources.get(&created.id).await.unwrap().is_none());
}

#[tokio::test]
async fn increment_views_bumps_counter() {
    let content = setup_service().await;
    let posts = content.blog_posts();
    let created = posts.create(&post("popular", true, false)).await.unwrap();
    assert_eq!(created.views, 0);

    content
        .increment_views(ContentKind::BlogPost, &created.id)
        .await
        .unwrap();
    content
        .increment_views(ContentKind::BlogPost, &created.id)
        .await
        .unwrap();

    let fetched = posts.get(&created.id).await.unwrap().unwrap();
    assert_eq!(fetched.views, 2);

    let err = content
        .increment_views(ContentKind::BlogPost, "missing")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}

#[tokio::test]
async fn toggle_featured_flips_flag() {
    let content = setup_service().await;
    let projects = content.projects();
    let created = projects.create(&project("P", false)).await.unwrap();

    let toggled = projects.toggle_featured(&created).await.unwrap();
    assert!(toggled.featured);
    assert_eq!(projects.featured().await.unwrap().len(), 1);

    let toggled = projects.toggle_featured(&toggled).await.unwrap();
    assert!(!toggled.featured);
    assert!(projects.featured().await.unwrap().is_empty());
}

#[tokio::test]
async fn count_includes_drafts() {
    let content = setup_service().await;
    content.blog_posts().create(&post("a", true, false)).await.unwrap();
    content.blog_posts().create(&post("b", false, false)).await.unwrap();
    content.podcast_episodes().create(&episode(1, false)).await.unwrap();

    assert_eq!(content.count(ContentKind::BlogPost).await.unwrap(), 2);
    assert_eq!(content.count(ContentKind::PodcastEpisode).await.unwrap(), 1);
    assert_eq!(content.count(ContentKind::CaseStudy).await.unwrap(), 0);
}

/// Fails every read of one table and passes the rest through.
struct BrokenTable {
    inner: SqliteStore,
    table: &'static str,
}

#[async_trait]
impl ContentStore for BrokenTable {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, StoreError> {
        if table == self.table {
            return Err(StoreError::Api {
                status: 503,
                code: None,
                message: "unavailable".into(),
            });
        }
        self.inner.select(table, query).await
    }

    async fn insert(&self, table: &str, record: Value) -> Result<Value, StoreError> {
        self.inner.insert(table, record).await
    }

    async fn update(&self, table: &str, id: &str, changes: Value) -> Result<Value, StoreError> {
        self.inner.update(table, id, changes).await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        self.inner.delete(table, id).await
    }

    async fn rpc(&self, function: &str, args: Value) -> Result<Value, StoreError> {
        self.inner.rpc(function, args).await
    }
}

#[tokio::test]
async fn dashboard_reports_other_counts_when_one_table_fails() {
    let store = BrokenTable {
        inner: SqliteStore::connect("sqlite::memory:").await.unwrap(),
        table: "case_studies_ap2024",
    };
    let content = ContentService::new(Arc::new(store), Tables::default());
    content.projects().create(&project("P", false)).await.unwrap();
    content.blog_posts().create(&post("a", false, false)).await.unwrap();
    content.blog_posts().create(&post("b", true, false)).await.unwrap();

    let stats = dashboard_stats(&content).await;

    assert_eq!(stats.projects, 1);
    assert_eq!(stats.blog_posts, 2);
    assert_eq!(stats.podcast_episodes, 0);
    assert_eq!(stats.case_studies, 0);
    assert_eq!(stats.failed, vec![ContentKind::CaseStudy]);
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[tokio::test]
async fn content_spans_record_table_and_id() {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let content = setup_service().await;
    let projects = content.projects();
    let created = projects.create(&project("logged", false)).await.unwrap();
    projects.delete(&created.id).await.unwrap();
    assert!(projects.delete("missing-id").await.is_err());

    let output = logs.contents();
    assert!(output.contains("table=projects_ap2024"), "{output}");
    assert!(output.contains(&format!("id={}", created.id)), "{output}");
    assert!(output.contains("id=missing-id"), "{output}");
}
