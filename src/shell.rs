//! Admin shell: decides what the admin area shows for the current auth state.

use std::sync::Arc;

use crate::auth::AuthError;
use crate::content::ContentService;
use crate::gate::{AuthContext, AuthPhase, AuthState};
use crate::model::{ContentKind, Identity};
use crate::store::StoreError;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MenuItem {
    pub name: &'static str,
    pub path: &'static str,
    pub kind: Option<ContentKind>,
}

pub const MENU: [MenuItem; 6] = [
    MenuItem { name: "Dashboard", path: "/admin", kind: None },
    MenuItem { name: "Projects", path: "/admin/projects", kind: Some(ContentKind::Project) },
    MenuItem { name: "Case Studies", path: "/admin/case-studies", kind: Some(ContentKind::CaseStudy) },
    MenuItem { name: "Blog Posts", path: "/admin/blog", kind: Some(ContentKind::BlogPost) },
    MenuItem { name: "Podcast", path: "/admin/podcast", kind: Some(ContentKind::PodcastEpisode) },
    MenuItem { name: "Resources", path: "/admin/resources", kind: Some(ContentKind::Resource) },
];

pub const LOGIN_PATH: &str = "/admin/login";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub display_name: String,
    pub avatar_url: String,
}

impl Profile {
    pub fn from_identity(identity: &Identity) -> Self {
        let display_name = identity
            .display_name
            .clone()
            .unwrap_or_else(|| identity.email.clone());
        let avatar_url = identity.avatar_url.clone().unwrap_or_else(|| {
            format!(
                "https://ui-avatars.com/api/?name={}&background=8b5cf6&color=fff",
                urlencoding::encode(&identity.email)
            )
        });
        Self {
            display_name,
            avatar_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminView {
    pub profile: Profile,
    pub menu: &'static [MenuItem],
}

impl AdminView {
    pub fn active_item(&self, path: &str) -> Option<&'static MenuItem> {
        self.menu.iter().find(|item| item.path == path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellRoute {
    Loading,
    RedirectToLogin,
    Render(AdminView),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginView {
    Loading,
    RedirectToDashboard,
    /// Show the sign-in button; `access_denied` when a non-admin is signed in.
    Prompt { access_denied: bool },
}

/// Route for any page inside the admin area.
pub fn route(state: &AuthState) -> ShellRoute {
    match (state.phase(), &state.identity) {
        (AuthPhase::Resolving, _) => ShellRoute::Loading,
        (AuthPhase::AuthenticatedAdmin, Some(identity)) => ShellRoute::Render(AdminView {
            profile: Profile::from_identity(identity),
            menu: &MENU,
        }),
        _ => ShellRoute::RedirectToLogin,
    }
}

pub fn login_view(state: &AuthState) -> LoginView {
    match state.phase() {
        AuthPhase::Resolving => LoginView::Loading,
        AuthPhase::AuthenticatedAdmin => LoginView::RedirectToDashboard,
        AuthPhase::AuthenticatedNonAdmin => LoginView::Prompt { access_denied: true },
        AuthPhase::Anonymous => LoginView::Prompt { access_denied: false },
    }
}

/// Record counts shown on the dashboard. Drafts count. A table that could
/// not be read shows 0 and is listed in `failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DashboardStats {
    pub projects: usize,
    pub case_studies: usize,
    pub blog_posts: usize,
    pub podcast_episodes: usize,
    pub resources: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<ContentKind>,
}

/// Counts for all five entity types, fetched concurrently.
pub async fn dashboard_stats(content: &ContentService) -> DashboardStats {
    let (projects, case_studies, blog_posts, podcast_episodes, resources) = futures::join!(
        content.count(ContentKind::Project),
        content.count(ContentKind::CaseStudy),
        content.count(ContentKind::BlogPost),
        content.count(ContentKind::PodcastEpisode),
        content.count(ContentKind::Resource),
    );
    let mut failed = Vec::new();
    let mut tally = |kind: ContentKind, result: Result<usize, StoreError>| match result {
        Ok(n) => n,
        Err(err) => {
            warn!(?err, %kind, "dashboard count failed");
            failed.push(kind);
            0
        }
    };
    let mut stats = DashboardStats {
        projects: tally(ContentKind::Project, projects),
        case_studies: tally(ContentKind::CaseStudy, case_studies),
        blog_posts: tally(ContentKind::BlogPost, blog_posts),
        podcast_episodes: tally(ContentKind::PodcastEpisode, podcast_episodes),
        resources: tally(ContentKind::Resource, resources),
        failed: Vec::new(),
    };
    stats.failed = failed;
    stats
}

pub struct AdminShell {
    auth: Arc<AuthContext>,
    content: ContentService,
}

impl AdminShell {
    pub fn new(auth: Arc<AuthContext>, content: ContentService) -> Self {
        Self { auth, content }
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    pub fn content(&self) -> &ContentService {
        &self.content
    }

    pub fn route(&self) -> ShellRoute {
        route(&self.auth.state())
    }

    pub fn login_view(&self) -> LoginView {
        login_view(&self.auth.state())
    }

    /// The admin view when the current identity may see it.
    pub fn authorized(&self) -> Option<AdminView> {
        match self.route() {
            ShellRoute::Render(view) => Some(view),
            _ => None,
        }
    }

    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.auth.sign_out().await
    }

    pub async fn dashboard(&self) -> DashboardStats {
        dashboard_stats(&self.content).await
    }
}
