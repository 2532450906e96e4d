//! Language detection: a cheap script heuristic first, the completion
//! service only when the script is inconclusive.

use std::time::Duration;

use tracing::debug;

use crate::services::CompletionService;

/// Detect language from character script alone. Returns `None` when the text
/// is Latin-script or too mixed to call, which is the signal to fall back to
/// the completion service.
pub fn detect_script(text: &str) -> Option<&'static str> {
    let mut cyrillic = 0usize;
    let mut kana = 0usize;
    let mut han = 0usize;
    let mut hangul = 0usize;
    let mut arabic = 0usize;
    let mut hebrew = 0usize;
    let mut greek = 0usize;
    let mut alphabetic = 0usize;

    for c in text.chars() {
        if !c.is_alphabetic() {
            continue;
        }
        alphabetic += 1;
        match c as u32 {
            0x0400..=0x04FF => cyrillic += 1,
            0x3040..=0x30FF => kana += 1,
            0x4E00..=0x9FFF => han += 1,
            0xAC00..=0xD7AF => hangul += 1,
            0x0600..=0x06FF => arabic += 1,
            0x0590..=0x05FF => hebrew += 1,
            0x0370..=0x03FF => greek += 1,
            _ => {}
        }
    }
    if alphabetic == 0 {
        return None;
    }

    // Any kana at all marks Japanese; pure Han is Chinese.
    let dominant = |count: usize| count * 10 >= alphabetic * 3;
    if kana > 0 && dominant(kana + han) {
        return Some("ja");
    }
    if dominant(cyrillic) {
        return Some("ru");
    }
    if dominant(han) {
        return Some("zh");
    }
    if dominant(hangul) {
        return Some("ko");
    }
    if dominant(arabic) {
        return Some("ar");
    }
    if dominant(hebrew) {
        return Some("he");
    }
    if dominant(greek) {
        return Some("el");
    }
    None
}

/// Full detection: script heuristic, then the completion service, then the
/// `"en"` default. Never fails.
pub async fn detect_language(
    completion: &dyn CompletionService,
    stage_timeout: Duration,
    text: &str,
) -> String {
    if let Some(lang) = detect_script(text) {
        return lang.to_string();
    }

    let excerpt: String = text.chars().take(400).collect();
    let result = tokio::time::timeout(
        stage_timeout,
        completion.complete(
            "Identify the language of the user's text. \
             Respond with only the two-letter ISO 639-1 code, nothing else.",
            &excerpt,
        ),
    )
    .await;

    match result {
        Ok(Ok(response)) => {
            let code: String = response
                .trim()
                .chars()
                .filter(|c| c.is_ascii_alphabetic())
                .take(2)
                .collect::<String>()
                .to_lowercase();
            if code.len() == 2 {
                return code;
            }
            debug!(response = %response, "Unusable language response; defaulting to en");
            "en".to_string()
        }
        _ => "en".to_string(),
    }
}
