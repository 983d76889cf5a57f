//! Routes pasted text, pasted images and dropped files to attachments.

use anyhow::Result;
use async_trait::async_trait;
use image::DynamicImage;
use providers::ModelRegistry;
use regex::Regex;
use services::web::{OEmbed, WebPage};
use services::youtube::{self, CaptionTrack};
use shared::{generate_numbered_name, AttachmentType, UiEvent, UiSender};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::attachments::AttachmentStore;
use crate::config::CoreConfig;

const NO_VISION: &str = "Image recognition is only available on specific models";

fn youtube_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(https?://)?(www\.)?(youtube|youtu|youtube-nocookie)\.(com|be)/(watch\?v=|embed/|v/|.+\?v=)?([^&=%\?]{11})",
        )
        .expect("valid regex")
    })
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://\S+").expect("valid regex"))
}

/// What a pasted string turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PastedText {
    YouTube { url: String, video_id: String },
    Website { url: String },
    Plain,
}

/// Classify clipboard text. YouTube links win over generic URLs.
pub fn classify_text(text: &str) -> PastedText {
    let text = text.trim();
    if let Some(caps) = youtube_regex().captures(text) {
        if let Some(id) = caps.get(6) {
            return PastedText::YouTube {
                url: text.to_string(),
                video_id: id.as_str().to_string(),
            };
        }
    }
    if url_regex().is_match(text) {
        return PastedText::Website {
            url: text.to_string(),
        };
    }
    PastedText::Plain
}

/// Video selected for transcript attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoInfo {
    pub video_id: String,
    pub title: String,
    pub author: String,
    pub url: String,
}

/// Network lookups behind the classifier
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn video_metadata(&self, url: &str) -> Result<OEmbed>;

    async fn caption_tracks(&self, video_id: &str) -> Result<Vec<CaptionTrack>>;

    /// Transcript text for one chooser option
    async fn transcript(&self, video_id: &str, option: &str) -> Result<String>;

    async fn page(&self, url: &str) -> Result<WebPage>;
}

/// Live fetchers: noembed, the YouTube watch page and plain HTTP
pub struct WebFetcher;

#[async_trait]
impl MediaFetcher for WebFetcher {
    async fn video_metadata(&self, url: &str) -> Result<OEmbed> {
        services::web::fetch_oembed(url).await
    }

    async fn caption_tracks(&self, video_id: &str) -> Result<Vec<CaptionTrack>> {
        youtube::list_caption_tracks(video_id).await
    }

    async fn transcript(&self, video_id: &str, option: &str) -> Result<String> {
        youtube::fetch_transcript(video_id, option).await
    }

    async fn page(&self, url: &str) -> Result<WebPage> {
        services::web::fetch_page(url).await
    }
}

/// Run `fut` to completion on a fresh single-threaded runtime.
fn block_on<F: std::future::Future>(fut: F) -> Result<F::Output> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(rt.block_on(fut))
}

fn safe_stem(raw: &str, fallback: &str) -> String {
    let stem: String = raw
        .chars()
        .map(|c| if c.is_alphanumeric() || c == ' ' || c == '-' { c } else { '_' })
        .take(80)
        .collect();
    let stem = stem.trim();
    if stem.is_empty() {
        fallback.to_string()
    } else {
        stem.to_string()
    }
}

pub struct Classifier {
    attachments: Arc<AttachmentStore>,
    registry: Arc<dyn ModelRegistry>,
    fetcher: Arc<dyn MediaFetcher>,
    config: CoreConfig,
    events: UiSender,
}

impl Classifier {
    pub fn new(
        attachments: Arc<AttachmentStore>,
        registry: Arc<dyn ModelRegistry>,
        fetcher: Arc<dyn MediaFetcher>,
        config: CoreConfig,
        events: UiSender,
    ) -> Self {
        Self {
            attachments,
            registry,
            fetcher,
            config,
            events,
        }
    }

    fn has_vision(&self) -> bool {
        self.registry.selected_model().is_some_and(|m| m.vision)
    }

    /// Handle pasted text. Links start their lookups in the background;
    /// plain text is left to the composer.
    pub fn paste_text(&self, text: &str) -> PastedText {
        let pasted = classify_text(text);
        match &pasted {
            PastedText::YouTube { url, video_id } => {
                self.events.emit(UiEvent::ComposerSensitive(false));
                let fetcher = Arc::clone(&self.fetcher);
                let events = self.events.clone();
                let url = url.clone();
                let video_id = video_id.clone();
                std::thread::spawn(move || {
                    let outcome = block_on(offer_transcripts(&*fetcher, &events, &url, &video_id))
                        .and_then(|r| r);
                    if let Err(e) = outcome {
                        tracing::error!("YouTube lookup failed for {}: {}", url, e);
                        events.toast("Error attaching video, please try again");
                    }
                    events.emit(UiEvent::ComposerSensitive(true));
                });
            }
            PastedText::Website { url } => {
                self.events
                    .emit(UiEvent::ConfirmWebsite { url: url.clone() });
            }
            PastedText::Plain => {}
        }
        pasted
    }

    /// Fetch the transcript chosen for `video` and attach it.
    pub fn attach_youtube(&self, video: VideoInfo, option: String) -> std::thread::JoinHandle<()> {
        let fetcher = Arc::clone(&self.fetcher);
        let attachments = Arc::clone(&self.attachments);
        let events = self.events.clone();
        let dir = self.config.youtube_dir();
        std::thread::spawn(move || {
            let outcome = block_on(fetcher.transcript(&video.video_id, &option))
                .and_then(|r| r)
                .and_then(|transcript| {
                    let content = youtube::transcript_document(
                        &video.title,
                        &video.author,
                        &video.url,
                        &transcript,
                    );
                    let path = dir.join(format!("{}.txt", safe_stem(&video.title, &video.video_id)));
                    write_cache(&path, &content)?;
                    Ok((path, content))
                });
            match outcome {
                Ok((path, content)) => {
                    attachments.attach_content(
                        &video.title,
                        Some(path),
                        AttachmentType::Youtube,
                        content,
                    );
                }
                Err(e) => {
                    tracing::error!("Failed to attach video {}: {}", video.video_id, e);
                    events.toast("Error attaching video, please try again");
                }
            }
        })
    }

    /// Fetch `url` and attach its readable text.
    pub fn attach_website(&self, url: String) -> std::thread::JoinHandle<()> {
        let fetcher = Arc::clone(&self.fetcher);
        let attachments = Arc::clone(&self.attachments);
        let events = self.events.clone();
        let dir = self.config.websites_dir();
        std::thread::spawn(move || {
            let outcome = block_on(fetcher.page(&url))
                .and_then(|r| r)
                .and_then(|page| {
                    let content = page.to_markdown();
                    let path = dir.join(format!("{}.md", page.file_stem()));
                    write_cache(&path, &content)?;
                    Ok((page, path, content))
                });
            match outcome {
                Ok((page, path, content)) => {
                    let name = page.title.clone().unwrap_or_else(|| url.clone());
                    attachments.attach_content(&name, Some(path), AttachmentType::Website, content);
                }
                Err(e) => {
                    tracing::error!("Failed to attach website {}: {}", url, e);
                    events.toast("Error attaching website, please try again");
                }
            }
        })
    }

    /// Save a pasted image as a numbered `image.png` and attach it.
    pub fn paste_image(&self, image: &DynamicImage) -> Option<String> {
        if !self.has_vision() {
            self.events.toast(NO_VISION);
            return None;
        }
        match self.save_pasted_image(image) {
            Ok(path) => self.attachments.attach(&path, AttachmentType::Image),
            Err(e) => {
                tracing::warn!("Failed to save pasted image: {}", e);
                self.events.toast("Cannot open image");
                None
            }
        }
    }

    fn save_pasted_image(&self, image: &DynamicImage) -> Result<PathBuf> {
        let dir = self.config.images_dir();
        fs::create_dir_all(&dir)?;
        let taken: Vec<String> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        let path = dir.join(generate_numbered_name("image.png", &taken));
        image.save_with_format(&path, image::ImageFormat::Png)?;
        Ok(path)
    }

    /// Attach dropped files by extension. Returns the names that were added.
    pub fn drop_files(&self, paths: &[PathBuf]) -> Vec<String> {
        let mut added = Vec::new();
        for path in paths {
            let Some(kind) = AttachmentType::from_path(path) else {
                tracing::debug!("Ignoring dropped file {}", path.display());
                continue;
            };
            if kind == AttachmentType::Image && !self.has_vision() {
                self.events.toast(NO_VISION);
                continue;
            }
            if let Some(name) = self.attachments.attach(path, kind) {
                added.push(name);
            }
        }
        added
    }
}

async fn offer_transcripts(
    fetcher: &dyn MediaFetcher,
    events: &UiSender,
    url: &str,
    video_id: &str,
) -> Result<()> {
    let data = fetcher.video_metadata(url).await?;
    let tracks = fetcher.caption_tracks(video_id).await?;
    if tracks.is_empty() {
        events.toast("This video does not have any transcriptions");
        return Ok(());
    }
    events.emit(UiEvent::ChooseTranscript {
        video_id: video_id.to_string(),
        title: data.title,
        author: data.author_name,
        url: if data.url.is_empty() { url.to_string() } else { data.url },
        tracks: youtube::track_options(&tracks),
    });
    Ok(())
}

fn write_cache(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::wait_for;
    use providers::{ModelCatalog, ModelInfo};
    use shared::{ui_channel, UiQueue};
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeFetcher {
        tracks: Vec<CaptionTrack>,
        fail: bool,
    }

    #[async_trait]
    impl MediaFetcher for FakeFetcher {
        async fn video_metadata(&self, url: &str) -> Result<OEmbed> {
            if self.fail {
                anyhow::bail!("offline");
            }
            Ok(OEmbed {
                title: "Rust in 100 Seconds".into(),
                author_name: "Fireship".into(),
                url: url.to_string(),
                error: None,
            })
        }

        async fn caption_tracks(&self, _video_id: &str) -> Result<Vec<CaptionTrack>> {
            Ok(self.tracks.clone())
        }

        async fn transcript(&self, _video_id: &str, _option: &str) -> Result<String> {
            Ok("hello world".into())
        }

        async fn page(&self, url: &str) -> Result<WebPage> {
            Ok(WebPage {
                url: url.to_string(),
                title: Some("Example".into()),
                text: "Body text".into(),
            })
        }
    }

    fn track(name: &str, code: &str, auto: bool) -> CaptionTrack {
        CaptionTrack {
            name: name.into(),
            language_code: code.into(),
            auto_generated: auto,
            base_url: format!("https://example.com/{code}"),
        }
    }

    struct Fixture {
        classifier: Classifier,
        attachments: Arc<AttachmentStore>,
        catalog: Arc<ModelCatalog>,
        queue: UiQueue,
        _dir: TempDir,
    }

    fn fixture(fetcher: FakeFetcher) -> Fixture {
        let dir = TempDir::new().unwrap();
        let (tx, queue) = ui_channel();
        let attachments = Arc::new(AttachmentStore::new(tx.clone()));
        let catalog = Arc::new(ModelCatalog::new());
        catalog.set_models(vec![ModelInfo::new("llama3.2:3b")]);
        let config = CoreConfig::at(dir.path().join("data"), dir.path().join("cache"));
        let classifier = Classifier::new(
            attachments.clone(),
            catalog.clone(),
            Arc::new(fetcher),
            config,
            tx,
        );
        Fixture {
            classifier,
            attachments,
            catalog,
            queue,
            _dir: dir,
        }
    }

    #[test]
    fn test_youtube_short_circuits_url() {
        assert_eq!(
            classify_text("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            PastedText::YouTube {
                url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
                video_id: "dQw4w9WgXcQ".into()
            }
        );
        assert!(matches!(
            classify_text("https://youtu.be/dQw4w9WgXcQ"),
            PastedText::YouTube { video_id, .. } if video_id == "dQw4w9WgXcQ"
        ));
        assert_eq!(
            classify_text("https://example.com/page"),
            PastedText::Website {
                url: "https://example.com/page".into()
            }
        );
        assert_eq!(classify_text("see https://example.com"), PastedText::Plain);
        assert_eq!(classify_text("just words"), PastedText::Plain);
    }

    #[test]
    fn test_youtube_paste_offers_tracks() {
        let f = fixture(FakeFetcher {
            tracks: vec![track("Spanish", "es", false)],
            fail: false,
        });
        f.classifier
            .paste_text("https://www.youtube.com/watch?v=dQw4w9WgXcQ");

        let event = wait_for(&f.queue, |e| matches!(e, UiEvent::ChooseTranscript { .. }))
            .expect("tracks offered");
        match event {
            UiEvent::ChooseTranscript {
                video_id,
                title,
                tracks,
                ..
            } => {
                assert_eq!(video_id, "dQw4w9WgXcQ");
                assert_eq!(title, "Rust in 100 Seconds");
                assert_eq!(tracks, vec!["Spanish (es)", "English (translate:en)"]);
            }
            _ => unreachable!(),
        }
        assert!(wait_for(&f.queue, |e| *e == UiEvent::ComposerSensitive(true)).is_some());
    }

    #[test]
    fn test_youtube_without_tracks_toasts() {
        let f = fixture(FakeFetcher::default());
        f.classifier.paste_text("https://youtu.be/dQw4w9WgXcQ");
        let toast = wait_for(&f.queue, |e| matches!(e, UiEvent::Toast { .. })).unwrap();
        assert!(matches!(
            toast,
            UiEvent::Toast { message, .. } if message == "This video does not have any transcriptions"
        ));
    }

    #[test]
    fn test_youtube_failure_toasts_and_reenables() {
        let f = fixture(FakeFetcher {
            tracks: vec![],
            fail: true,
        });
        f.classifier.paste_text("https://youtu.be/dQw4w9WgXcQ");
        let toast = wait_for(&f.queue, |e| matches!(e, UiEvent::Toast { .. })).unwrap();
        assert!(matches!(
            toast,
            UiEvent::Toast { message, .. } if message == "Error attaching video, please try again"
        ));
        assert!(wait_for(&f.queue, |e| *e == UiEvent::ComposerSensitive(true)).is_some());
    }

    #[test]
    fn test_website_paste_asks_first() {
        let f = fixture(FakeFetcher::default());
        f.classifier.paste_text("https://example.com/a");
        assert_eq!(
            f.queue.drain(),
            vec![UiEvent::ConfirmWebsite {
                url: "https://example.com/a".into()
            }]
        );

        f.classifier
            .attach_website("https://example.com/a".into())
            .join()
            .unwrap();
        let attachment = f.attachments.get("Example").unwrap();
        assert_eq!(attachment.kind, AttachmentType::Website);
        assert!(attachment.content.starts_with("https://example.com/a\n"));
        assert!(attachment.path.unwrap().is_file());
    }

    #[test]
    fn test_attach_youtube_writes_document() {
        let f = fixture(FakeFetcher::default());
        let video = VideoInfo {
            video_id: "dQw4w9WgXcQ".into(),
            title: "Rust in 100 Seconds".into(),
            author: "Fireship".into(),
            url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
        };
        f.classifier
            .attach_youtube(video, "English (en)".into())
            .join()
            .unwrap();

        let attachment = f.attachments.get("Rust in 100 Seconds").unwrap();
        assert_eq!(attachment.kind, AttachmentType::Youtube);
        let lines: Vec<&str> = attachment.content.lines().collect();
        assert_eq!(lines[0], "Rust in 100 Seconds");
        assert_eq!(lines[1], "Fireship");
        assert_eq!(lines[2], "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
    }

    #[test]
    fn test_images_need_vision() {
        let f = fixture(FakeFetcher::default());
        let image = DynamicImage::new_rgb8(4, 4);
        assert_eq!(f.classifier.paste_image(&image), None);
        assert!(f.attachments.is_empty());

        f.catalog.set_models(vec![ModelInfo {
            name: "llava:7b".into(),
            vision: true,
            tools: false,
        }]);
        assert_eq!(f.classifier.paste_image(&image).as_deref(), Some("image.png"));
        assert_eq!(f.classifier.paste_image(&image).as_deref(), Some("image 1.png"));
    }

    #[test]
    fn test_drop_files_by_extension() {
        let f = fixture(FakeFetcher::default());
        let dir = TempDir::new().unwrap();
        let notes = dir.path().join("notes.md");
        let script = dir.path().join("main.rs");
        let unknown = dir.path().join("archive.bin");
        let picture = dir.path().join("cat.png");
        fs::write(&notes, "# notes").unwrap();
        fs::write(&script, "fn main() {}").unwrap();
        fs::write(&unknown, [0u8, 1, 2]).unwrap();
        DynamicImage::new_rgb8(2, 2).save(&picture).unwrap();

        let added = f
            .classifier
            .drop_files(&[notes, script, unknown, picture]);
        assert_eq!(added, vec!["notes.md", "main.rs"]);
        assert_eq!(f.attachments.get("main.rs").unwrap().kind, AttachmentType::Code);
        assert!(f.queue.drain().iter().any(|e| matches!(
            e,
            UiEvent::Toast { message, .. } if message == NO_VISION
        )));
    }
}
