//! YouTube caption tracks and transcripts.
//!
//! Track metadata comes from the `captionTracks` array embedded in the watch
//! page; transcripts are the timedtext XML each track points at.

use anyhow::{anyhow, Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;

use crate::web::{html_decode, SHARED_HTTP};

/// Option offered when no manual English track exists
pub const TRANSLATE_OPTION: &str = "English (translate:en)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionTrack {
    pub name: String,
    pub language_code: String,
    pub auto_generated: bool,
    pub base_url: String,
}

impl CaptionTrack {
    /// Label shown in the transcript chooser, e.g. `English (en)`.
    pub fn label(&self) -> String {
        if self.auto_generated && !self.name.contains("auto-generated") {
            format!("{} (auto-generated) ({})", self.name, self.language_code)
        } else {
            format!("{} ({})", self.name, self.language_code)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTrack {
    base_url: String,
    #[serde(default)]
    name: RawName,
    language_code: String,
    #[serde(default)]
    kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawName {
    simple_text: Option<String>,
    #[serde(default)]
    runs: Vec<RawRun>,
}

#[derive(Debug, Deserialize)]
struct RawRun {
    text: String,
}

impl From<RawTrack> for CaptionTrack {
    fn from(raw: RawTrack) -> Self {
        let name = raw
            .name
            .simple_text
            .unwrap_or_else(|| raw.name.runs.into_iter().map(|r| r.text).collect());
        CaptionTrack {
            name,
            language_code: raw.language_code,
            auto_generated: raw.kind.as_deref() == Some("asr"),
            base_url: raw.base_url.replace("\\u0026", "&"),
        }
    }
}

/// Pull the caption track list out of a watch page.
pub(crate) fn parse_caption_tracks(page: &str) -> Result<Vec<CaptionTrack>> {
    const MARKER: &str = "\"captionTracks\":";
    let Some(start) = page.find(MARKER) else {
        return Ok(Vec::new());
    };
    let rest = &page[start + MARKER.len()..];
    let raw: Vec<RawTrack> = serde_json::Deserializer::from_str(rest)
        .into_iter::<Vec<RawTrack>>()
        .next()
        .ok_or_else(|| anyhow!("caption track list is empty"))?
        .context("malformed caption track list")?;
    Ok(raw.into_iter().map(CaptionTrack::from).collect())
}

/// List the caption tracks of a video.
pub async fn list_caption_tracks(video_id: &str) -> Result<Vec<CaptionTrack>> {
    let url = format!("https://www.youtube.com/watch?v={}", video_id);
    let response = SHARED_HTTP
        .get(url)
        .header("Accept-Language", "en-US,en;q=0.8")
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(anyhow!("watch page fetch failed with {}", response.status()));
    }
    parse_caption_tracks(&response.text().await?)
}

/// Chooser options for a track list. Unless there is more than one track and
/// at least one manual English track, a machine-translation option is
/// inserted at index 1.
pub fn track_options(tracks: &[CaptionTrack]) -> Vec<String> {
    let mut options: Vec<String> = tracks.iter().map(CaptionTrack::label).collect();
    let has_manual_english = options.len() > 1
        && options
            .iter()
            .any(|o| o.contains("(en") && !o.contains("auto-generated"));
    if !has_manual_english {
        let at = options.len().min(1);
        options.insert(at, TRANSLATE_OPTION.to_string());
    }
    options
}

/// Which track an option refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackChoice {
    Language(String),
    TranslateTo(String),
}

impl TrackChoice {
    /// Parse the trailing `(code)` or `(translate:code)` of an option label.
    pub fn from_option(option: &str) -> Option<Self> {
        let inner = option.trim().strip_suffix(')')?;
        let code = &inner[inner.rfind('(')? + 1..];
        match code.strip_prefix("translate:") {
            Some(target) => Some(TrackChoice::TranslateTo(target.to_string())),
            None => Some(TrackChoice::Language(code.to_string())),
        }
    }

    /// Resolve to a timedtext URL from the available tracks.
    pub fn timedtext_url(&self, tracks: &[CaptionTrack]) -> Option<String> {
        match self {
            TrackChoice::Language(code) => tracks
                .iter()
                .find(|t| &t.language_code == code && !t.auto_generated)
                .or_else(|| tracks.iter().find(|t| &t.language_code == code))
                .map(|t| t.base_url.clone()),
            TrackChoice::TranslateTo(target) => tracks
                .iter()
                .find(|t| !t.auto_generated)
                .or_else(|| tracks.first())
                .map(|t| format!("{}&tlang={}", t.base_url, target)),
        }
    }
}

/// Flatten timedtext XML into one caption per line.
pub(crate) fn parse_timedtext(xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut lines = Vec::new();
    let mut current: Option<String> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"text" => current = Some(String::new()),
            Event::Text(t) => {
                if let Some(line) = current.as_mut() {
                    line.push_str(&t.unescape()?);
                }
            }
            Event::End(e) if e.name().as_ref() == b"text" => {
                if let Some(line) = current.take() {
                    let line = html_decode(&line).replace('\n', " ");
                    if !line.trim().is_empty() {
                        lines.push(line.trim().to_string());
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(lines.join("\n"))
}

/// Download the transcript for the chosen option.
pub async fn fetch_transcript(video_id: &str, option: &str) -> Result<String> {
    let choice =
        TrackChoice::from_option(option).ok_or_else(|| anyhow!("unknown transcript: {}", option))?;
    let tracks = list_caption_tracks(video_id).await?;
    let url = choice
        .timedtext_url(&tracks)
        .ok_or_else(|| anyhow!("transcript {} is not available", option))?;

    let response = SHARED_HTTP.get(url).send().await?;
    if !response.status().is_success() {
        return Err(anyhow!("transcript fetch failed with {}", response.status()));
    }
    let transcript = parse_timedtext(&response.text().await?)?;
    if transcript.is_empty() {
        return Err(anyhow!("transcript {} is empty", option));
    }
    Ok(transcript)
}

/// Attachment body for a video transcript: title, author and URL on the
/// first three lines, then the captions.
pub fn transcript_document(title: &str, author: &str, url: &str, transcript: &str) -> String {
    format!("{title}\n{author}\n{url}\n\n{transcript}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(name: &str, code: &str, auto: bool) -> CaptionTrack {
        CaptionTrack {
            name: name.to_string(),
            language_code: code.to_string(),
            auto_generated: auto,
            base_url: format!("https://www.youtube.com/api/timedtext?v=x&lang={code}"),
        }
    }

    #[test]
    fn test_parse_caption_tracks_from_watch_page() {
        let page = r#"var ytInitialPlayerResponse = {"captions":{"playerCaptionsTracklistRenderer":{"captionTracks":[{"baseUrl":"https://www.youtube.com/api/timedtext?v=abc&lang=en","name":{"simpleText":"English"},"languageCode":"en"},{"baseUrl":"https://www.youtube.com/api/timedtext?v=abc&lang=de&kind=asr","name":{"runs":[{"text":"German"}]},"languageCode":"de","kind":"asr"}],"audioTracks":[]}}};"#;
        let tracks = parse_caption_tracks(page).unwrap();

        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].label(), "English (en)");
        assert_eq!(tracks[1].label(), "German (auto-generated) (de)");
        assert!(tracks[1].auto_generated);
    }

    #[test]
    fn test_page_without_captions_has_no_tracks() {
        assert!(parse_caption_tracks("<html>nothing here</html>")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_translate_option_inserted_without_manual_english() {
        let options = track_options(&[track("German", "de", false), track("English", "en", true)]);
        assert_eq!(
            options,
            vec![
                "German (de)".to_string(),
                TRANSLATE_OPTION.to_string(),
                "English (auto-generated) (en)".to_string(),
            ]
        );
    }

    #[test]
    fn test_no_translate_option_with_manual_english() {
        let options = track_options(&[track("German", "de", false), track("English", "en", false)]);
        assert_eq!(options, vec!["German (de)", "English (en)"]);
    }

    #[test]
    fn test_single_english_track_still_gets_translate_option() {
        let options = track_options(&[track("English", "en", false)]);
        assert_eq!(options, vec!["English (en)", TRANSLATE_OPTION]);
    }

    #[test]
    fn test_track_choice_resolution() {
        let tracks = vec![track("German", "de", false), track("English", "en", true)];

        let choice = TrackChoice::from_option("English (auto-generated) (en)").unwrap();
        assert_eq!(choice, TrackChoice::Language("en".into()));
        assert!(choice.timedtext_url(&tracks).unwrap().ends_with("lang=en"));

        let choice = TrackChoice::from_option(TRANSLATE_OPTION).unwrap();
        assert_eq!(choice, TrackChoice::TranslateTo("en".into()));
        assert!(choice
            .timedtext_url(&tracks)
            .unwrap()
            .ends_with("lang=de&tlang=en"));

        assert_eq!(TrackChoice::from_option("no code"), None);
    }

    #[test]
    fn test_parse_timedtext() {
        let xml = r#"<?xml version="1.0" encoding="utf-8" ?><transcript><text start="0.1" dur="2">Never gonna</text><text start="2.1" dur="2">give you up &amp;#39;cause</text><text start="4" dur="1"> </text></transcript>"#;
        assert_eq!(parse_timedtext(xml).unwrap(), "Never gonna\ngive you up 'cause");
    }

    #[test]
    fn test_transcript_document() {
        assert_eq!(
            transcript_document("Song", "Rick", "https://youtu.be/x", "la la"),
            "Song\nRick\nhttps://youtu.be/x\n\nla la"
        );
    }
}
