use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Signed-in person as reported by the auth provider. Never written back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Provider-issued session. `expires_at` is `None` when the provider did not
/// say; such a session is treated as valid until it is replaced.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub identity: Identity,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |exp| exp > now)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Row of the admin allowlist table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminAllowlistEntry {
    pub email: String,
    #[serde(rename = "is_active")]
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Project,
    CaseStudy,
    BlogPost,
    PodcastEpisode,
    Resource,
}

impl ContentKind {
    pub const ALL: [ContentKind; 5] = [
        ContentKind::Project,
        ContentKind::CaseStudy,
        ContentKind::BlogPost,
        ContentKind::PodcastEpisode,
        ContentKind::Resource,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Project => "project",
            ContentKind::CaseStudy => "case_study",
            ContentKind::BlogPost => "blog_post",
            ContentKind::PodcastEpisode => "podcast_episode",
            ContentKind::Resource => "resource",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "project" | "projects" => Some(ContentKind::Project),
            "case_study" | "case_studies" => Some(ContentKind::CaseStudy),
            "blog_post" | "blog_posts" | "blog" => Some(ContentKind::BlogPost),
            "podcast_episode" | "podcast_episodes" | "podcast" => {
                Some(ContentKind::PodcastEpisode)
            }
            "resource" | "resources" => Some(ContentKind::Resource),
            _ => None,
        }
    }

    /// Records of this kind carry a `published` flag that hides them from
    /// public listings.
    pub fn is_publishable(&self) -> bool {
        matches!(self, ContentKind::BlogPost | ContentKind::PodcastEpisode)
    }

    /// Column the listings sort on, newest/highest first.
    pub fn order_column(&self) -> &'static str {
        match self {
            ContentKind::PodcastEpisode => "episode_number",
            _ => "created_at",
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
