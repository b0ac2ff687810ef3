//! Photo link rewriting for cloud-drive share URLs.

const DRIVE_HOST: &str = "drive.google.com";
const CDN_PREFIX: &str = "https://lh3.googleusercontent.com/d/";
// Size hint large enough for the full-screen profile view.
const CDN_SIZE_HINT: &str = "=s2000";

const SHEET_HOST_PATH: &str = "docs.google.com/spreadsheets/d/";

/// Rewrite a Google Drive share link into a direct-embeddable CDN image URL.
///
/// Empty strings, `data:` URLs and anything that is not a Drive link pass
/// through untouched, as do folder shares (no single image to show) and
/// links from which no file id can be extracted. Never fails.
pub fn rewrite_photo_url(url: &str) -> String {
    let url = url.trim();
    if url.is_empty() || url.starts_with("data:") || !url.contains(DRIVE_HOST) {
        return url.to_string();
    }
    if url.contains("/folders/") {
        return url.to_string();
    }
    match extract_file_id(url) {
        Some(id) if !id.is_empty() => format!("{}{}{}", CDN_PREFIX, id, CDN_SIZE_HINT),
        _ => url.to_string(),
    }
}

/// Pull the file id out of a Drive share URL. An `id=` query parameter wins
/// over a `/d/<id>` path segment.
fn extract_file_id(url: &str) -> Option<&str> {
    if let Some((_, rest)) = url.split_once("id=") {
        return Some(rest.split('&').next().unwrap_or(rest));
    }
    if let Some((_, rest)) = url.split_once("/d/") {
        let end = rest.find(['/', '=']).unwrap_or(rest.len());
        return Some(&rest[..end]);
    }
    None
}

/// Rewrite a published Google Sheets URL into its CSV export form.
/// Non-sheet URLs pass through unchanged; no network access happens here.
pub fn sheet_export_url(url: &str) -> String {
    let url = url.trim();
    if let Some((_, rest)) = url.split_once(SHEET_HOST_PATH) {
        let id = rest.split('/').next().unwrap_or(rest);
        if !id.is_empty() {
            return format!(
                "https://docs.google.com/spreadsheets/d/{}/export?format=csv",
                id
            );
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_file_share_link() {
        let out = rewrite_photo_url("https://drive.google.com/file/d/ABC123/view");
        assert!(out.contains("ABC123"));
        assert!(!out.contains("drive.google.com"));
        assert_eq!(out, "https://lh3.googleusercontent.com/d/ABC123=s2000");
    }

    #[test]
    fn test_rewrite_prefers_id_query_parameter() {
        let out = rewrite_photo_url("https://drive.google.com/open?id=XYZ9&usp=sharing");
        assert_eq!(out, "https://lh3.googleusercontent.com/d/XYZ9=s2000");
    }

    #[test]
    fn test_rewrite_handles_path_id_terminated_by_equals() {
        let out = rewrite_photo_url("https://drive.google.com/file/d/QQ77=w100");
        assert_eq!(out, "https://lh3.googleusercontent.com/d/QQ77=s2000");
    }

    #[test]
    fn test_rewrite_passes_through_non_drive_urls() {
        assert_eq!(
            rewrite_photo_url("https://example.com/photo.jpg"),
            "https://example.com/photo.jpg"
        );
        assert_eq!(rewrite_photo_url(""), "");
        assert_eq!(
            rewrite_photo_url("data:image/png;base64,AAAA"),
            "data:image/png;base64,AAAA"
        );
    }

    #[test]
    fn test_rewrite_passes_through_folder_shares_and_unparseable_links() {
        let folder = "https://drive.google.com/drive/folders/F00";
        assert_eq!(rewrite_photo_url(folder), folder);
        let odd = "https://drive.google.com/something-else";
        assert_eq!(rewrite_photo_url(odd), odd);
    }

    #[test]
    fn test_sheet_export_url_rewrite() {
        assert_eq!(
            sheet_export_url("https://docs.google.com/spreadsheets/d/SHEET1/edit#gid=0"),
            "https://docs.google.com/spreadsheets/d/SHEET1/export?format=csv"
        );
        assert_eq!(
            sheet_export_url("https://example.com/data.csv"),
            "https://example.com/data.csv"
        );
    }
}
