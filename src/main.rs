use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use portfolio_cms::auth::{AuthProvider, GoTrueClient};
use portfolio_cms::config::{self, Backend, Config};
use portfolio_cms::content::{
    BlogPost, CaseStudy, ContentService, Entity, PodcastEpisode, Project, Resource, Visibility,
};
use portfolio_cms::gate::{AdminDirectory, AuthContext, SignInOptions};
use portfolio_cms::model::ContentKind;
use portfolio_cms::shell::{AdminShell, AdminView, LoginView, ShellRoute, LOGIN_PATH};
use portfolio_cms::store::{ContentStore, PostgrestClient, SqliteStore};

#[derive(Debug, Parser)]
#[command(author, version, about = "Manage portfolio content from the terminal")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the federated sign-in URL to open in a browser
    Login,
    /// Finish sign-in from the URL the browser was redirected to
    Callback { url: Url },
    /// End the current session
    Logout,
    /// Show who is signed in and whether they may use the admin area
    Whoami,
    /// List records; `--all` includes drafts (admin only)
    List {
        #[arg(value_parser = parse_kind)]
        kind: ContentKind,
        #[arg(long)]
        all: bool,
    },
    /// List featured projects or blog posts
    Featured {
        #[arg(value_parser = parse_kind)]
        kind: ContentKind,
    },
    /// Create a record from a YAML or JSON file
    Create {
        #[arg(value_parser = parse_kind)]
        kind: ContentKind,
        #[arg(long)]
        file: PathBuf,
    },
    /// Apply a partial update from a YAML or JSON file
    Update {
        #[arg(value_parser = parse_kind)]
        kind: ContentKind,
        id: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Delete a record
    Delete {
        #[arg(value_parser = parse_kind)]
        kind: ContentKind,
        id: String,
    },
    /// Flip the featured flag of a project
    ToggleFeatured { id: String },
    /// Show a record and count the view
    View {
        #[arg(value_parser = parse_kind)]
        kind: ContentKind,
        id: String,
    },
    /// Record counts for the dashboard, drafts included
    Stats,
}

fn parse_kind(raw: &str) -> Result<ContentKind, String> {
    ContentKind::parse_kind(raw).ok_or_else(|| {
        format!("unknown content kind {raw:?} (projects, case-studies, blog, podcast, resources)")
    })
}

/// Runs `$body` with `$T` bound to the entity type for `$kind`.
macro_rules! with_entity {
    ($kind:expr, $T:ident => $body:expr) => {
        match $kind {
            ContentKind::Project => {
                type $T = Project;
                $body
            }
            ContentKind::CaseStudy => {
                type $T = CaseStudy;
                $body
            }
            ContentKind::BlogPost => {
                type $T = BlogPost;
                $body
            }
            ContentKind::PodcastEpisode => {
                type $T = PodcastEpisode;
                $body
            }
            ContentKind::Resource => {
                type $T = Resource;
                $body
            }
        }
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let gotrue = Arc::new(
        GoTrueClient::with_session_file(
            cfg.supabase_url()?,
            cfg.supabase.anon_key.clone(),
            cfg.session_file(),
        )
        .await?,
    );

    if let Command::Callback { url } = &args.command {
        gotrue
            .complete_sign_in(url)
            .await
            .context("failed to complete sign-in")?;
    }

    let access_token = match gotrue.current_session().await {
        Ok(session) => session.map(|s| s.access_token),
        Err(err) => {
            warn!(?err, "stored session unusable; continuing signed out");
            None
        }
    };
    let store = build_store(&cfg, access_token.as_deref()).await?;

    let provider: Arc<dyn AuthProvider> = gotrue.clone();
    let auth = Arc::new(AuthContext::new(
        provider,
        AdminDirectory::new(store.clone(), cfg.tables.admin_users.clone()),
        SignInOptions {
            provider: cfg.auth.provider.clone(),
            redirect_to: cfg.redirect_to()?,
        },
    ));
    if let Err(err) = auth.initialize().await {
        warn!(?err, "could not resolve session");
    }
    let shell = AdminShell::new(auth.clone(), ContentService::new(store, cfg.tables.clone()));

    let result = run(&shell, args.command).await;
    auth.dispose();
    result
}

async fn build_store(cfg: &Config, access_token: Option<&str>) -> Result<Arc<dyn ContentStore>> {
    match cfg.store.backend {
        Backend::Remote => {
            let client = PostgrestClient::new(cfg.supabase_url()?, cfg.supabase.anon_key.clone());
            let client = match access_token {
                Some(token) => client.with_access_token(token),
                None => client,
            };
            Ok(Arc::new(client))
        }
        Backend::Sqlite => {
            let database_url = std::env::var("DATABASE_URL")
                .ok()
                .or_else(|| cfg.store.database_url.clone())
                .unwrap_or_else(|| format!("sqlite://{}/cms.db", cfg.resolved_data_dir().display()));
            info!(%database_url, "using local store");
            Ok(Arc::new(SqliteStore::connect(&database_url).await?))
        }
    }
}

fn require_admin(shell: &AdminShell) -> Result<AdminView> {
    match shell.route() {
        ShellRoute::Render(view) => Ok(view),
        ShellRoute::Loading => bail!("sign-in state is still resolving"),
        ShellRoute::RedirectToLogin => match shell.login_view() {
            LoginView::Prompt { access_denied: true } => {
                bail!("access denied: this account is not an admin")
            }
            _ => bail!("not signed in; run `login` ({LOGIN_PATH})"),
        },
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// YAML is a superset of JSON, so one parser covers both file formats.
fn read_document<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("invalid record in {}", path.display()))
}

async fn create<T: Entity>(content: &ContentService, file: &Path) -> Result<()> {
    let record: T = read_document(file)?;
    print_json(&content.collection::<T>().create(&record).await?)
}

async fn update<T: Entity>(content: &ContentService, id: &str, file: &Path) -> Result<()> {
    let patch: T::Patch = read_document(file)?;
    print_json(&content.collection::<T>().update(id, &patch).await?)
}

async fn list<T: Entity>(content: &ContentService) -> Result<()> {
    print_json(&content.collection::<T>().list().await?)
}

async fn run(shell: &AdminShell, command: Command) -> Result<()> {
    let content = shell.content();
    match command {
        Command::Login => {
            let url = shell.auth().sign_in().await?;
            println!("Open this URL to sign in, then run `callback <redirect-url>`:");
            println!("{url}");
        }
        Command::Callback { .. } | Command::Whoami => {
            let state = shell.auth().state();
            match &state.identity {
                Some(identity) => println!("signed in as {}", identity.email),
                None => println!("not signed in"),
            }
            match shell.route() {
                ShellRoute::Render(view) => {
                    println!("{} (admin)", view.profile.display_name);
                    println!("avatar: {}", view.profile.avatar_url);
                    for item in view.menu {
                        println!("  {:<14} {}", item.name, item.path);
                    }
                }
                _ => {
                    if let LoginView::Prompt { access_denied: true } = shell.login_view() {
                        println!("access denied: this account is not an admin");
                    }
                }
            }
        }
        Command::Logout => {
            shell.sign_out().await?;
            println!("signed out");
        }
        Command::List { kind, all } => {
            let visibility = if all {
                require_admin(shell)?;
                Visibility::All
            } else {
                Visibility::PublishedOnly
            };
            match kind {
                ContentKind::BlogPost => print_json(&content.blog_posts().list_with(visibility).await?)?,
                ContentKind::PodcastEpisode => {
                    print_json(&content.podcast_episodes().list_with(visibility).await?)?
                }
                other => with_entity!(other, T => list::<T>(content).await?),
            }
        }
        Command::Featured { kind } => match kind {
            ContentKind::Project => print_json(&content.projects().featured().await?)?,
            ContentKind::BlogPost => print_json(&content.blog_posts().featured().await?)?,
            other => bail!("{other} records have no featured listing"),
        },
        Command::Create { kind, file } => {
            require_admin(shell)?;
            with_entity!(kind, T => create::<T>(content, &file).await?)
        }
        Command::Update { kind, id, file } => {
            require_admin(shell)?;
            with_entity!(kind, T => update::<T>(content, &id, &file).await?)
        }
        Command::Delete { kind, id } => {
            require_admin(shell)?;
            with_entity!(kind, T => content.collection::<T>().delete(&id).await?);
            println!("deleted {kind} {id}");
        }
        Command::ToggleFeatured { id } => {
            require_admin(shell)?;
            let projects = content.projects();
            let project = projects
                .get(&id)
                .await?
                .ok_or_else(|| anyhow!("project {id} not found"))?;
            print_json(&projects.toggle_featured(&project).await?)?;
        }
        Command::View { kind, id } => {
            let record = with_entity!(kind, T => content
                .collection::<T>()
                .get(&id)
                .await?
                .map(serde_json::to_value)
                .transpose()?);
            let record = record.ok_or_else(|| anyhow!("{kind} {id} not found"))?;
            if kind.is_publishable() && record["published"] != serde_json::Value::Bool(true) {
                bail!("{kind} {id} not found");
            }
            if matches!(kind, ContentKind::BlogPost | ContentKind::PodcastEpisode) {
                content.increment_views(kind, &id).await?;
            }
            print_json(&record)?;
        }
        Command::Stats => {
            require_admin(shell)?;
            print_json(&shell.dashboard().await)?;
        }
    }
    Ok(())
}
