#![forbid(unsafe_code)]

//! HTTP API for the catalogue.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tastemakers::{
    Catalog, CatalogError, CatalogResult,
    catalog::{Category, Comment, CommentId, Profile, User, UserId, Video, VideoId},
    comments::CommentNode,
    config::{self, DEFAULT_CONFIG_PATH},
    ingest,
    ranking::{DEFAULT_PAGE_SIZE, Page, VideoOrdering, VideoSummary},
    users::NewUser,
    youtube::{VideoApi, YouTubeClient},
};
use tokio::{signal, task};

const LIKED_LIMIT: u32 = 20;

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the Tastemakers catalogue API.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the config file")]
    config: PathBuf,
}

#[derive(Clone)]
struct AppState {
    catalog: Arc<Mutex<Catalog>>,
    api: Arc<dyn VideoApi>,
    region: Arc<str>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        let status = match &err {
            CatalogError::NotFound { .. } => StatusCode::NOT_FOUND,
            CatalogError::Conflict(_) => StatusCode::CONFLICT,
            CatalogError::Invalid(_) => StatusCode::BAD_REQUEST,
            CatalogError::MissingReference(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CatalogError::Api { .. } | CatalogError::Transport(_) => StatusCode::BAD_GATEWAY,
            CatalogError::Database(_) | CatalogError::Io { .. } => {
                log::error!("request failed: {err}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut settings = config::load_settings_from(&cli.config)?;
    if let Some(port) = std::env::var("TASTEMAKERS_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        settings.port = port;
    }

    let catalog = Catalog::open(&settings.database_path).with_context(|| {
        format!(
            "opening catalogue database {}",
            settings.database_path.display()
        )
    })?;
    let api = YouTubeClient::new(settings.api_url.clone(), settings.api_key.clone())
        .with_retry_budget(settings.api_retry);
    let state = AppState::new(catalog, Arc::new(api), &settings.region);

    let addr = SocketAddr::new(
        settings
            .host
            .parse()
            .with_context(|| format!("parsing host {}", settings.host))?,
        settings.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    log::info!("API server listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/videos", get(list_videos).post(create_videos))
        .route("/api/videos/liked", get(liked_videos))
        .route("/api/videos/{id}", get(get_video))
        .route(
            "/api/videos/{id}/votes",
            post(vote_video).put(change_video_vote),
        )
        .route("/api/videos/{id}/views", post(snapshot_views))
        .route(
            "/api/videos/{id}/comments",
            get(video_comments).post(create_comment),
        )
        .route(
            "/api/comments/{id}/votes",
            post(vote_comment).put(change_comment_vote),
        )
        .route("/api/users", post(create_user))
        .route("/api/users/{id}", get(get_user))
        .route("/api/users/{id}/following", post(follow_user))
        .route("/api/categories", get(list_categories))
        .route("/api/categories/sync", post(sync_categories))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        log::error!("Failed to install Ctrl+C handler: {}", err);
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    list_by: Option<String>,
    page: Option<u32>,
    per_page: Option<u32>,
    descending: Option<bool>,
}

#[derive(Debug, Serialize)]
struct VideoListing {
    title: &'static str,
    list_by: VideoOrdering,
    page: u32,
    videos: Vec<VideoSummary>,
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    uploader_id: UserId,
    video_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VoteRequest {
    voter_id: UserId,
    value: i64,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
struct ScoreResponse {
    score: i64,
}

#[derive(Debug, Default, Deserialize)]
struct CommentParams {
    depth: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CommentRequest {
    commenter_id: UserId,
    parent_id: Option<CommentId>,
    text: String,
}

#[derive(Debug, Deserialize)]
struct FollowRequest {
    followee_id: UserId,
}

#[derive(Debug, Serialize)]
struct UserDetail {
    #[serde(flatten)]
    user: User,
    profile: Profile,
    following: Vec<UserId>,
    followers: Vec<UserId>,
}

#[derive(Debug, Serialize)]
struct SnapshotResponse {
    recorded: usize,
}

async fn list_videos(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<VideoListing>> {
    let ordering = params
        .list_by
        .as_deref()
        .map(VideoOrdering::from_keyword)
        .unwrap_or_default();
    let page = Page::new(
        params.page.unwrap_or(1),
        params.per_page.unwrap_or(DEFAULT_PAGE_SIZE),
    );
    let descending = params.descending.unwrap_or(true);
    let videos = state
        .with_catalog(move |catalog| catalog.list_videos(ordering, descending, page))
        .await?;
    Ok(Json(VideoListing {
        title: ordering.title(),
        list_by: ordering,
        page: page.number(),
        videos,
    }))
}

async fn liked_videos(State(state): State<AppState>) -> ApiResult<Json<Vec<VideoSummary>>> {
    let videos = state
        .with_catalog(|catalog| catalog.most_liked(LIKED_LIMIT))
        .await?;
    Ok(Json(videos))
}

async fn get_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<VideoId>,
) -> ApiResult<Json<VideoSummary>> {
    let video = state
        .with_catalog(move |catalog| catalog.video_summary(id))
        .await?;
    Ok(Json(video))
}

async fn create_videos(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> ApiResult<(StatusCode, Json<Vec<Video>>)> {
    let catalog = state.catalog.clone();
    let api = state.api.clone();
    let videos = task::spawn_blocking(move || {
        ingest::ingest_videos(
            &catalog,
            api.as_ref(),
            request.uploader_id,
            &request.video_ids,
        )
    })
    .await
    .map_err(|err| ApiError::internal(format!("task join error: {err}")))??;
    Ok((StatusCode::CREATED, Json(videos)))
}

async fn vote_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<VideoId>,
    Json(vote): Json<VoteRequest>,
) -> ApiResult<(StatusCode, Json<ScoreResponse>)> {
    let score = state
        .with_catalog(move |catalog| {
            catalog.vote_video(id, vote.voter_id, vote.value)?;
            catalog.video_score(id)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(ScoreResponse { score })))
}

async fn change_video_vote(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<VideoId>,
    Json(vote): Json<VoteRequest>,
) -> ApiResult<Json<ScoreResponse>> {
    let score = state
        .with_catalog(move |catalog| {
            catalog.change_video_vote(id, vote.voter_id, vote.value)?;
            catalog.video_score(id)
        })
        .await?;
    Ok(Json(ScoreResponse { score }))
}

async fn snapshot_views(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<VideoId>,
) -> ApiResult<(StatusCode, Json<SnapshotResponse>)> {
    let catalog = state.catalog.clone();
    let api = state.api.clone();
    let recorded = task::spawn_blocking(move || {
        let mut catalog = catalog.lock();
        ingest::record_view_counts(&mut catalog, api.as_ref(), &[id])
    })
    .await
    .map_err(|err| ApiError::internal(format!("task join error: {err}")))??;
    Ok((StatusCode::CREATED, Json(SnapshotResponse { recorded })))
}

async fn video_comments(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<VideoId>,
    Query(params): Query<CommentParams>,
) -> ApiResult<Json<Vec<CommentNode>>> {
    let forest = state
        .with_catalog(move |catalog| catalog.comment_forest(id, params.depth))
        .await?;
    Ok(Json(forest))
}

async fn create_comment(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<VideoId>,
    Json(request): Json<CommentRequest>,
) -> ApiResult<(StatusCode, Json<Comment>)> {
    let comment = state
        .with_catalog(move |catalog| {
            catalog.create_comment(id, request.commenter_id, request.parent_id, &request.text)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

async fn vote_comment(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<CommentId>,
    Json(vote): Json<VoteRequest>,
) -> ApiResult<(StatusCode, Json<ScoreResponse>)> {
    let score = state
        .with_catalog(move |catalog| {
            catalog.vote_comment(id, vote.voter_id, vote.value)?;
            catalog.comment_score(id)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(ScoreResponse { score })))
}

async fn change_comment_vote(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<CommentId>,
    Json(vote): Json<VoteRequest>,
) -> ApiResult<Json<ScoreResponse>> {
    let score = state
        .with_catalog(move |catalog| {
            catalog.change_comment_vote(id, vote.voter_id, vote.value)?;
            catalog.comment_score(id)
        })
        .await?;
    Ok(Json(ScoreResponse { score }))
}

async fn create_user(
    State(state): State<AppState>,
    Json(new_user): Json<NewUser>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let user = state
        .with_catalog(move |catalog| catalog.create_user(new_user))
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn get_user(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<UserId>,
) -> ApiResult<Json<UserDetail>> {
    let detail = state
        .with_catalog(move |catalog| {
            Ok(UserDetail {
                user: catalog.user(id)?,
                profile: catalog.profile(id)?,
                following: catalog.following(id)?,
                followers: catalog.followers(id)?,
            })
        })
        .await?;
    Ok(Json(detail))
}

async fn follow_user(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<UserId>,
    Json(request): Json<FollowRequest>,
) -> ApiResult<Json<Vec<UserId>>> {
    let following = state
        .with_catalog(move |catalog| {
            catalog.follow_user(id, request.followee_id)?;
            catalog.following(id)
        })
        .await?;
    Ok(Json(following))
}

async fn list_categories(State(state): State<AppState>) -> ApiResult<Json<Vec<Category>>> {
    let categories = state.with_catalog(|catalog| catalog.categories()).await?;
    Ok(Json(categories))
}

async fn sync_categories(State(state): State<AppState>) -> ApiResult<Json<Vec<Category>>> {
    let catalog = state.catalog.clone();
    let api = state.api.clone();
    let region = state.region.clone();
    let categories = task::spawn_blocking(move || {
        let fetched = api.categories(&region)?;
        let mut catalog = catalog.lock();
        catalog.upsert_categories(&fetched)?;
        log::info!("synced {} categories for region {region}", fetched.len());
        catalog.categories()
    })
    .await
    .map_err(|err| ApiError::internal(format!("task join error: {err}")))??;
    Ok(Json(categories))
}

impl AppState {
    fn new(catalog: Catalog, api: Arc<dyn VideoApi>, region: &str) -> Self {
        Self {
            catalog: Arc::new(Mutex::new(catalog)),
            api,
            region: Arc::from(region),
        }
    }

    /// Runs `f` against the catalogue on the blocking pool.
    async fn with_catalog<T, F>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce(&mut Catalog) -> CatalogResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let catalog = self.catalog.clone();
        let result = task::spawn_blocking(move || {
            let mut catalog = catalog.lock();
            f(&mut catalog)
        })
        .await
        .map_err(|err| ApiError::internal(format!("task join error: {err}")))?;
        Ok(result?)
    }
}
