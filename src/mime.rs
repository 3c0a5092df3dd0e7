// Output content types chosen from the requested filename.

pub const DEFAULT_MIME: &str = "application/octet-stream";

/// Media types the generic table gets wrong or leaves out.
const MEDIA_TYPES: &[(&str, &str)] = &[
    ("mp4", "video/mp4"),
    ("m4v", "video/mp4"),
    ("m4a", "audio/mp4"),
    ("webm", "video/webm"),
    ("weba", "audio/webm"),
    ("mkv", "video/x-matroska"),
    ("mp3", "audio/mpeg"),
    ("opus", "audio/ogg"),
    ("ogg", "audio/ogg"),
    ("flac", "audio/flac"),
    ("3gp", "video/3gpp"),
];

/// Lower-cased extension of `filename`, if it has one.
pub fn extension_of(filename: &str) -> Option<String> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn mime_for_extension(ext: &str) -> String {
    let ext = ext.trim_start_matches('.').to_ascii_lowercase();
    if let Some((_, mime)) = MEDIA_TYPES.iter().find(|(e, _)| *e == ext) {
        return (*mime).to_string();
    }
    mime_guess::from_ext(&ext)
        .first_raw()
        .unwrap_or(DEFAULT_MIME)
        .to_string()
}

/// MIME type for `filename`; unknown or missing extensions map to [`DEFAULT_MIME`].
pub fn mime_for_filename(filename: &str) -> String {
    match extension_of(filename) {
        Some(ext) => mime_for_extension(&ext),
        None => DEFAULT_MIME.to_string(),
    }
}
