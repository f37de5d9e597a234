use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use chrono::Utc;
use serde_json::Value;
use song_catalog::{
    HttpSettings, build_app, db,
    services::{
        catalog_store::SongCatalog,
        identity::{IdentityError, IdentityVerifier, VerifiedToken},
        media_store::{MediaError, MediaKind, MediaStore, StoredMedia},
        song_service::SongService,
        staging::Staging,
        user_service::UserDirectory,
    },
    state::AppState,
};
use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

const ADMIN_TOKEN: &str = "admin-token";
const FAN_TOKEN: &str = "fan-token";
const ADMIN_EMAIL: &str = "admin@example.com";

/// Accepts a fixed set of tokens.
struct StaticVerifier {
    tokens: HashMap<String, VerifiedToken>,
}

#[async_trait]
impl IdentityVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedToken, IdentityError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| IdentityError::Rejected("unknown token".into()))
    }
}

/// Catalog changes made by "another request" while a cover upload is in flight.
enum UploadHook {
    BumpVersion(Uuid),
    RejectSongWrites,
}

/// Records every call; individual operations can be made to fail or stall.
#[derive(Default)]
struct FakeMedia {
    uploads: Mutex<Vec<(MediaKind, String)>>,
    deletes: Mutex<Vec<(MediaKind, String)>>,
    counter: AtomicUsize,
    fail_image_uploads: AtomicBool,
    slow_image_uploads: AtomicBool,
    fail_deletes: AtomicBool,
    on_image_upload: Mutex<Option<UploadHook>>,
    catalog: Option<SongCatalog>,
}

impl FakeMedia {
    fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    fn deleted_ids(&self) -> Vec<String> {
        self.deletes
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id)| id.clone())
            .collect()
    }
}

#[async_trait]
impl MediaStore for FakeMedia {
    async fn upload(&self, path: &Path, kind: MediaKind) -> Result<StoredMedia, MediaError> {
        assert!(path.exists(), "staged file must exist while uploading");
        if kind == MediaKind::Image && self.slow_image_uploads.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(600)).await;
            assert!(path.exists(), "staged file must outlive a cancelled request");
        }
        if kind == MediaKind::Image && self.fail_image_uploads.load(Ordering::SeqCst) {
            return Err(MediaError::Provider {
                status: 502,
                message: "cover upload exploded".into(),
            });
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let public_id = format!("{}/blob{}", kind.folder(), n);
        self.uploads.lock().unwrap().push((kind, public_id.clone()));
        if kind == MediaKind::Image {
            let hook = self.on_image_upload.lock().unwrap().take();
            if let (Some(hook), Some(catalog)) = (hook, self.catalog.as_ref()) {
                match hook {
                    UploadHook::BumpVersion(id) => {
                        let mut song = catalog.find(id).await.unwrap().unwrap();
                        song.title = "Renamed Elsewhere".into();
                        catalog.update_versioned(&song).await.unwrap();
                    }
                    UploadHook::RejectSongWrites => {
                        sqlx::query(
                            "CREATE TRIGGER songs_read_only BEFORE UPDATE ON songs \
                             BEGIN SELECT RAISE(ABORT, 'catalog is read-only'); END",
                        )
                            .execute(&*catalog.db)
                            .await
                            .unwrap();
                    }
                }
            }
        }
        Ok(StoredMedia {
            url: format!("https://cdn.example/upload/v1/{}.bin", public_id),
            public_id,
        })
    }

    async fn delete(&self, public_id: &str, kind: MediaKind) -> Result<(), MediaError> {
        self.deletes
            .lock()
            .unwrap()
            .push((kind, public_id.to_string()));
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(MediaError::Provider {
                status: 500,
                message: "delete exploded".into(),
            });
        }
        Ok(())
    }
}

struct Harness {
    app: Router,
    media: Arc<FakeMedia>,
    catalog: SongCatalog,
    songs: SongService,
    staging_dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        Self::with_settings(HttpSettings::default()).await
    }

    async fn with_settings(settings: HttpSettings) -> Self {
        let pool = Arc::new(db::connect_memory().await.unwrap());
        let users = UserDirectory::new(pool.clone());
        users.seed_admins(&[ADMIN_EMAIL.to_string()]).await.unwrap();

        let mut tokens = HashMap::new();
        tokens.insert(
            ADMIN_TOKEN.to_string(),
            VerifiedToken {
                subject_id: "uid-admin".into(),
                email: ADMIN_EMAIL.into(),
                name: Some("Admin".into()),
            },
        );
        tokens.insert(
            FAN_TOKEN.to_string(),
            VerifiedToken {
                subject_id: "uid-fan".into(),
                email: "fan@example.com".into(),
                name: None,
            },
        );

        let staging_dir = tempfile::tempdir().unwrap();
        let catalog = SongCatalog::new(pool.clone());
        let media = Arc::new(FakeMedia {
            catalog: Some(catalog.clone()),
            ..FakeMedia::default()
        });
        let songs = SongService::new(catalog.clone(), media.clone());

        let state = AppState {
            db: pool,
            songs: songs.clone(),
            users,
            verifier: Arc::new(StaticVerifier { tokens }),
            staging: Staging::new(staging_dir.path()),
        };
        let app = build_app(state, &settings);

        Self {
            app,
            media,
            catalog,
            songs,
            staging_dir,
        }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn song_count(&self) -> usize {
        self.catalog.list_newest_first().await.unwrap().len()
    }

    fn staged_files(&self) -> usize {
        std::fs::read_dir(self.staging_dir.path()).unwrap().count()
    }

    /// Wait for work that outlives its request to finish.
    async fn settle(&self, done: impl Fn(&Self) -> bool) {
        for _ in 0..100 {
            if done(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("background work did not settle");
    }

    async fn create(&self, title: &str, artist: &str) -> Value {
        let (status, body) = self
            .send(
                MultipartForm::new()
                    .text("title", title)
                    .text("artist", artist)
                    .file("songFile", "track.mp3", "audio/mpeg", b"ID3 audio")
                    .file("coverImage", "cover.png", "image/png", b"PNG image")
                    .request("POST", "/api/upload", Some(ADMIN_TOKEN)),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        body["song"].clone()
    }
}

struct MultipartForm {
    boundary: &'static str,
    body: Vec<u8>,
}

impl MultipartForm {
    fn new() -> Self {
        Self {
            boundary: "catalog-test-boundary",
            body: Vec::new(),
        }
    }

    fn text(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                self.boundary, name, value
            )
            .as_bytes(),
        );
        self
    }

    fn file(mut self, name: &str, file_name: &str, content_type: &str, bytes: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                self.boundary, name, file_name, content_type
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(bytes);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    fn request(mut self, method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        let mut builder = Request::builder().method(method).uri(uri).header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", self.boundary),
        );
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(self.body)).unwrap()
    }
}

fn plain(method: &str, uri: &str, auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn public_test_endpoint_needs_no_token() {
    let h = Harness::new().await;
    let (status, body) = h.send(plain("GET", "/api/test", None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["message"].as_str().is_some());
    assert!(body["timestamp"].as_str().is_some());
}

#[tokio::test]
async fn protected_routes_reject_missing_or_invalid_tokens() {
    let h = Harness::new().await;
    let existing = h.create("Keep", "Me").await;
    let id = existing["id"].as_str().unwrap().to_string();
    let uploads_before = h.media.upload_count();

    let requests = vec![
        plain("GET", "/api/songs", None),
        plain("GET", "/api/songs", Some("Basic YWRtaW46cGFzcw==")),
        plain("GET", "/api/songs", Some("Bearer nope")),
        plain("DELETE", &format!("/api/songs/{}", id), None),
        plain("DELETE", &format!("/api/songs/{}", id), Some("Bearer nope")),
        MultipartForm::new()
            .text("title", "Sneaky")
            .text("artist", "Nobody")
            .file("songFile", "a.mp3", "audio/mpeg", b"a")
            .file("coverImage", "c.png", "image/png", b"c")
            .request("POST", "/api/upload", None),
        MultipartForm::new()
            .text("title", "Renamed")
            .request("PUT", &format!("/api/songs/{}", id), Some("stolen")),
    ];

    for request in requests {
        let (status, body) = h.send(request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().is_some());
    }

    assert_eq!(h.media.upload_count(), uploads_before);
    assert!(h.media.deleted_ids().is_empty());
    let songs = h.catalog.list_newest_first().await.unwrap();
    assert_eq!(songs.len(), 1);
    assert_eq!(songs[0].title, "Keep");
}

#[tokio::test]
async fn upload_with_missing_parts_is_rejected_before_any_remote_call() {
    let h = Harness::new().await;

    let cases = vec![
        MultipartForm::new()
            .text("title", "No Cover")
            .text("artist", "Someone")
            .file("songFile", "a.mp3", "audio/mpeg", b"audio"),
        MultipartForm::new()
            .text("title", "No Audio")
            .text("artist", "Someone")
            .file("coverImage", "c.png", "image/png", b"image"),
        MultipartForm::new()
            .text("artist", "Someone")
            .file("songFile", "a.mp3", "audio/mpeg", b"audio")
            .file("coverImage", "c.png", "image/png", b"image"),
        MultipartForm::new()
            .text("title", "   ")
            .text("artist", "Someone")
            .file("songFile", "a.mp3", "audio/mpeg", b"audio")
            .file("coverImage", "c.png", "image/png", b"image"),
        MultipartForm::new()
            .text("title", "Wrong Type")
            .text("artist", "Someone")
            .file("songFile", "a.txt", "text/plain", b"not audio")
            .file("coverImage", "c.png", "image/png", b"image"),
    ];

    for form in cases {
        let (status, body) = h
            .send(form.request("POST", "/api/upload", Some(ADMIN_TOKEN)))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
        assert!(body["error"].as_str().is_some());
    }

    assert_eq!(h.media.upload_count(), 0);
    assert_eq!(h.song_count().await, 0);
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn non_admin_upload_is_forbidden_before_upload() {
    let h = Harness::new().await;

    let (status, body) = h
        .send(
            MultipartForm::new()
                .text("title", "Fan Song")
                .text("artist", "Fan")
                .file("songFile", "a.mp3", "audio/mpeg", b"audio")
                .file("coverImage", "c.png", "image/png", b"image")
                .request("POST", "/api/upload", Some(FAN_TOKEN)),
        )
        .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Access denied: admin only");
    assert_eq!(h.media.upload_count(), 0);
    assert_eq!(h.song_count().await, 0);
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn created_song_shows_up_in_listing() {
    let h = Harness::new().await;

    let (status, body) = h
        .send(
            MultipartForm::new()
                .text("title", "Test Song")
                .text("artist", "Test Artist")
                .file("songFile", "track.mp3", "audio/mpeg", b"ID3 audio")
                .file("coverImage", "cover.png", "image/png", b"PNG image")
                .request("POST", "/api/upload", Some(ADMIN_TOKEN)),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Song uploaded successfully");
    assert_eq!(h.staged_files(), 0);

    // any authenticated user may list
    let (status, listed) = h.send(plain("GET", "/api/songs", Some("Bearer fan-token"))).await;
    assert_eq!(status, StatusCode::OK);
    let songs = listed.as_array().unwrap();
    assert_eq!(songs.len(), 1);
    let song = &songs[0];
    assert_eq!(song["title"], "Test Song");
    assert_eq!(song["artist"], "Test Artist");
    assert!(!song["audioUrl"].as_str().unwrap().is_empty());
    assert!(!song["coverUrl"].as_str().unwrap().is_empty());
    assert!(song["uploadedAt"].as_str().is_some());
    assert_eq!(song["id"], body["song"]["id"]);
}

#[tokio::test]
async fn listing_is_newest_first() {
    let h = Harness::new().await;
    h.create("Older", "A").await;
    h.create("Newer", "B").await;

    let (_, listed) = h
        .send(plain("GET", "/api/songs", Some("Bearer admin-token")))
        .await;
    let titles: Vec<_> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["title"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(titles, vec!["Newer", "Older"]);
}

#[tokio::test]
async fn deleting_missing_song_is_not_found_every_time() {
    let h = Harness::new().await;
    let uri = format!("/api/songs/{}", uuid::Uuid::new_v4());

    for _ in 0..2 {
        let (status, body) = h.send(plain("DELETE", &uri, Some("Bearer admin-token"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Song not found");
    }

    let (status, _) = h
        .send(plain("DELETE", "/api/songs/not-a-uuid", Some("Bearer admin-token")))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(h.media.deleted_ids().is_empty());
}

#[tokio::test]
async fn delete_removes_both_blobs_and_record() {
    let h = Harness::new().await;
    let song = h.create("Gone Soon", "Someone").await;
    let id = song["id"].as_str().unwrap();

    let (status, body) = h
        .send(plain("DELETE", &format!("/api/songs/{}", id), Some("Bearer admin-token")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Song deleted successfully");

    let mut deleted = h.media.deleted_ids();
    deleted.sort();
    assert_eq!(deleted, vec!["covers/blob1".to_string(), "songs/blob0".to_string()]);
    assert_eq!(h.song_count().await, 0);
}

#[tokio::test]
async fn delete_succeeds_even_when_media_deletes_fail() {
    let h = Harness::new().await;
    let song = h.create("Stubborn", "Blob").await;
    let id = song["id"].as_str().unwrap();
    h.media.fail_deletes.store(true, Ordering::SeqCst);

    let (status, _) = h
        .send(plain("DELETE", &format!("/api/songs/{}", id), Some("Bearer admin-token")))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.media.deleted_ids().len(), 2);
    assert_eq!(h.song_count().await, 0);
}

#[tokio::test]
async fn non_admin_cannot_delete_or_update() {
    let h = Harness::new().await;
    let song = h.create("Protected", "Admin").await;
    let uri = format!("/api/songs/{}", song["id"].as_str().unwrap());

    let (status, _) = h.send(plain("DELETE", &uri, Some("Bearer fan-token"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = h
        .send(
            MultipartForm::new()
                .text("title", "Hijacked")
                .request("PUT", &uri, Some(FAN_TOKEN)),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let songs = h.catalog.list_newest_first().await.unwrap();
    assert_eq!(songs[0].title, "Protected");
    assert!(h.media.deleted_ids().is_empty());
}

#[tokio::test]
async fn title_only_update_keeps_artist_and_cover() {
    let h = Harness::new().await;
    let song = h.create("Draft Title", "Steady Artist").await;
    let uri = format!("/api/songs/{}", song["id"].as_str().unwrap());

    let (status, updated) = h
        .send(
            MultipartForm::new()
                .text("title", "Final Title")
                .text("artist", "")
                .request("PUT", &uri, Some(ADMIN_TOKEN)),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{}", updated);
    assert_eq!(updated["title"], "Final Title");
    assert_eq!(updated["artist"], "Steady Artist");
    assert_eq!(updated["coverUrl"], song["coverUrl"]);
    assert_eq!(updated["audioUrl"], song["audioUrl"]);
    assert_eq!(updated["version"], 2);
    assert_eq!(h.media.upload_count(), 2);
    assert!(h.media.deleted_ids().is_empty());
}

#[tokio::test]
async fn cover_update_uploads_new_cover_then_removes_old() {
    let h = Harness::new().await;
    let song = h.create("Artful", "Painter").await;
    let uri = format!("/api/songs/{}", song["id"].as_str().unwrap());

    let (status, updated) = h
        .send(
            MultipartForm::new()
                .file("coverImage", "new.jpg", "image/jpeg", b"JPEG")
                .request("PUT", &uri, Some(ADMIN_TOKEN)),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{}", updated);
    assert_eq!(updated["coverPublicId"], "covers/blob2");
    assert_ne!(updated["coverUrl"], song["coverUrl"]);
    assert_eq!(updated["title"], "Artful");
    assert_eq!(h.media.deleted_ids(), vec!["covers/blob1".to_string()]);
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn failed_cover_upload_leaves_song_untouched() {
    let h = Harness::new().await;
    let song = h.create("Original", "Band").await;
    let uri = format!("/api/songs/{}", song["id"].as_str().unwrap());
    h.media.fail_image_uploads.store(true, Ordering::SeqCst);

    let (status, body) = h
        .send(
            MultipartForm::new()
                .text("title", "Changed")
                .file("coverImage", "new.jpg", "image/jpeg", b"JPEG")
                .request("PUT", &uri, Some(ADMIN_TOKEN)),
        )
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("cover upload exploded"));
    let songs = h.catalog.list_newest_first().await.unwrap();
    assert_eq!(songs[0].title, "Original");
    assert_eq!(songs[0].version, 1);
    assert!(h.media.deleted_ids().is_empty());
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn updating_missing_song_is_not_found() {
    let h = Harness::new().await;
    let uri = format!("/api/songs/{}", uuid::Uuid::new_v4());

    let (status, _) = h
        .send(
            MultipartForm::new()
                .text("title", "Ghost")
                .file("coverImage", "new.jpg", "image/jpeg", b"JPEG")
                .request("PUT", &uri, Some(ADMIN_TOKEN)),
        )
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(h.media.upload_count(), 0);
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn failed_cover_upload_rolls_back_audio_on_create() {
    let h = Harness::new().await;
    h.media.fail_image_uploads.store(true, Ordering::SeqCst);

    let (status, body) = h
        .send(
            MultipartForm::new()
                .text("title", "Half Done")
                .text("artist", "Someone")
                .file("songFile", "a.mp3", "audio/mpeg", b"audio")
                .file("coverImage", "c.png", "image/png", b"image")
                .request("POST", "/api/upload", Some(ADMIN_TOKEN)),
        )
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("cover upload exploded"));
    assert_eq!(h.media.deleted_ids(), vec!["songs/blob0".to_string()]);
    assert_eq!(h.song_count().await, 0);
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn concurrent_identical_uploads_create_distinct_songs() {
    let h = Harness::new().await;

    let (a, b) = tokio::join!(h.create("Twin", "Echo"), h.create("Twin", "Echo"));
    assert_ne!(a["id"], b["id"]);

    let songs = h.catalog.list_newest_first().await.unwrap();
    assert_eq!(songs.len(), 2);
    assert!(songs.iter().all(|s| s.title == "Twin" && s.artist == "Echo"));
}

#[tokio::test]
async fn startup_purge_removes_fixture_songs_and_blobs() {
    let h = Harness::new().await;
    h.create("Test Song", "Test Artist").await;
    h.create("Real Song", "Real Artist").await;

    let purged = h.songs.purge_test_fixtures().await.unwrap();

    assert_eq!(purged, 1);
    let songs = h.catalog.list_newest_first().await.unwrap();
    assert_eq!(songs.len(), 1);
    assert_eq!(songs[0].title, "Real Song");
    let mut deleted = h.media.deleted_ids();
    deleted.sort();
    assert_eq!(deleted, vec!["covers/blob1".to_string(), "songs/blob0".to_string()]);
}

#[tokio::test]
async fn readiness_checks_database_and_staging() {
    let h = Harness::new().await;
    let (status, body) = h.send(plain("GET", "/readyz", None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["sqlite"]["ok"], true);
    assert_eq!(body["checks"]["staging"]["ok"], true);
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn generic_binary_audio_is_accepted() {
    let h = Harness::new().await;

    let (status, body) = h
        .send(
            MultipartForm::new()
                .text("title", "Lossless")
                .text("artist", "Audiophile")
                .file("songFile", "track.flac", "application/octet-stream", b"fLaC")
                .file("coverImage", "cover.png", "image/png", b"PNG image")
                .request("POST", "/api/upload", Some(ADMIN_TOKEN)),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(h.song_count().await, 1);
}

#[tokio::test]
async fn update_conflicting_with_a_concurrent_edit_is_rolled_back() {
    let h = Harness::new().await;
    let song = h.create("Contested", "Band").await;
    let id = Uuid::parse_str(song["id"].as_str().unwrap()).unwrap();
    *h.media.on_image_upload.lock().unwrap() = Some(UploadHook::BumpVersion(id));

    let (status, body) = h
        .send(
            MultipartForm::new()
                .text("title", "Mine")
                .file("coverImage", "new.jpg", "image/jpeg", b"JPEG")
                .request("PUT", &format!("/api/songs/{}", id), Some(ADMIN_TOKEN)),
        )
        .await;

    assert_eq!(status, StatusCode::CONFLICT, "{}", body);
    assert!(body["error"].as_str().is_some());
    // the new cover is removed again; the concurrent edit wins
    assert_eq!(h.media.deleted_ids(), vec!["covers/blob2".to_string()]);
    let stored = h.catalog.find(id).await.unwrap().unwrap();
    assert_eq!(stored.title, "Renamed Elsewhere");
    assert_eq!(stored.version, 2);
    assert_eq!(stored.cover_public_id.as_deref(), Some("covers/blob1"));
    assert_eq!(stored.cover_url, song["coverUrl"].as_str().unwrap());
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn failed_update_persist_removes_new_cover() {
    let h = Harness::new().await;
    let song = h.create("Doomed", "Band").await;
    let id = Uuid::parse_str(song["id"].as_str().unwrap()).unwrap();
    *h.media.on_image_upload.lock().unwrap() = Some(UploadHook::RejectSongWrites);

    let (status, body) = h
        .send(
            MultipartForm::new()
                .text("title", "Never Saved")
                .file("coverImage", "new.jpg", "image/jpeg", b"JPEG")
                .request("PUT", &format!("/api/songs/{}", id), Some(ADMIN_TOKEN)),
        )
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{}", body);
    // only the new cover is deleted; the old one is still referenced
    assert_eq!(h.media.deleted_ids(), vec!["covers/blob2".to_string()]);
    let stored = h.catalog.find(id).await.unwrap().unwrap();
    assert_eq!(stored.title, "Doomed");
    assert_eq!(stored.version, 1);
    assert_eq!(stored.cover_public_id.as_deref(), Some("covers/blob1"));
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn cover_update_succeeds_when_old_cover_removal_fails() {
    let h = Harness::new().await;
    let song = h.create("Sticky", "Cover").await;
    let id = Uuid::parse_str(song["id"].as_str().unwrap()).unwrap();
    h.media.fail_deletes.store(true, Ordering::SeqCst);

    let (status, updated) = h
        .send(
            MultipartForm::new()
                .file("coverImage", "new.jpg", "image/jpeg", b"JPEG")
                .request("PUT", &format!("/api/songs/{}", id), Some(ADMIN_TOKEN)),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{}", updated);
    assert_eq!(updated["coverPublicId"], "covers/blob2");
    assert_eq!(h.media.deleted_ids(), vec!["covers/blob1".to_string()]);
    let stored = h.catalog.find(id).await.unwrap().unwrap();
    assert_eq!(stored.cover_public_id.as_deref(), Some("covers/blob2"));
    assert_eq!(stored.version, 2);
}

#[tokio::test]
async fn deleting_legacy_song_derives_media_ids_from_urls() {
    let h = Harness::new().await;
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO songs (id, title, artist, audio_url, audio_public_id, cover_url, cover_public_id, uploaded_at, version) \
         VALUES (?, ?, ?, ?, NULL, ?, NULL, ?, 1)",
    )
    .bind(id)
    .bind("Old Timer")
    .bind("Legacy Band")
    .bind("https://res.cloudinary.com/demo/video/upload/v1700000000/songs/legacy-track.mp3")
    .bind("https://res.cloudinary.com/demo/image/upload/v1700000000/covers/legacy-cover.png")
    .bind(Utc::now())
    .execute(&*h.catalog.db)
    .await
    .unwrap();

    let (status, _) = h
        .send(plain("DELETE", &format!("/api/songs/{}", id), Some("Bearer admin-token")))
        .await;

    assert_eq!(status, StatusCode::OK);
    let mut deleted = h.media.deletes.lock().unwrap().clone();
    deleted.sort_by(|a, b| a.1.cmp(&b.1));
    assert_eq!(
        deleted,
        vec![
            (MediaKind::Image, "covers/legacy-cover".to_string()),
            (MediaKind::Audio, "songs/legacy-track".to_string()),
        ]
    );
    assert_eq!(h.song_count().await, 0);
}

fn quick_timeout() -> HttpSettings {
    HttpSettings {
        request_timeout: Duration::from_millis(200),
        ..HttpSettings::default()
    }
}

#[tokio::test]
async fn timed_out_upload_still_rolls_back_and_cleans_staging() {
    let h = Harness::with_settings(quick_timeout()).await;
    h.media.slow_image_uploads.store(true, Ordering::SeqCst);
    h.media.fail_image_uploads.store(true, Ordering::SeqCst);

    let (status, _) = h
        .send(
            MultipartForm::new()
                .text("title", "Too Slow")
                .text("artist", "Snail")
                .file("songFile", "a.mp3", "audio/mpeg", b"audio")
                .file("coverImage", "c.png", "image/png", b"image")
                .request("POST", "/api/upload", Some(ADMIN_TOKEN)),
        )
        .await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);

    h.settle(|h| h.staged_files() == 0 && !h.media.deleted_ids().is_empty())
        .await;
    assert_eq!(h.media.deleted_ids(), vec!["songs/blob0".to_string()]);
    assert_eq!(h.song_count().await, 0);
}

#[tokio::test]
async fn timed_out_upload_completes_in_the_background() {
    let h = Harness::with_settings(quick_timeout()).await;
    h.media.slow_image_uploads.store(true, Ordering::SeqCst);

    let (status, _) = h
        .send(
            MultipartForm::new()
                .text("title", "Late Bloomer")
                .text("artist", "Snail")
                .file("songFile", "a.mp3", "audio/mpeg", b"audio")
                .file("coverImage", "c.png", "image/png", b"image")
                .request("POST", "/api/upload", Some(ADMIN_TOKEN)),
        )
        .await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);

    h.settle(|h| h.staged_files() == 0).await;
    let songs = h.catalog.list_newest_first().await.unwrap();
    assert_eq!(songs.len(), 1);
    assert_eq!(songs[0].title, "Late Bloomer");
    assert_eq!(songs[0].cover_public_id.as_deref(), Some("covers/blob1"));
    assert!(h.media.deleted_ids().is_empty());
}

#[tokio::test]
async fn timed_out_cover_update_still_applies() {
    let h = Harness::with_settings(quick_timeout()).await;
    let song = h.create("Patient", "Owner").await;
    let id = Uuid::parse_str(song["id"].as_str().unwrap()).unwrap();
    h.media.slow_image_uploads.store(true, Ordering::SeqCst);

    let (status, _) = h
        .send(
            MultipartForm::new()
                .file("coverImage", "new.jpg", "image/jpeg", b"JPEG")
                .request("PUT", &format!("/api/songs/{}", id), Some(ADMIN_TOKEN)),
        )
        .await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);

    h.settle(|h| h.staged_files() == 0 && !h.media.deleted_ids().is_empty())
        .await;
    assert_eq!(h.media.deleted_ids(), vec!["covers/blob1".to_string()]);
    let stored = h.catalog.find(id).await.unwrap().unwrap();
    assert_eq!(stored.cover_public_id.as_deref(), Some("covers/blob2"));
}
