use url::Url;

/// Join a backend base URL and an endpoint path, keeping any path prefix on
/// the base (e.g. a reverse-proxy mount point) and dropping query strings.
pub fn endpoint_url(base_url: &str, path: &str) -> Result<String, String> {
    let mut parsed = Url::parse(base_url.trim()).map_err(|e| e.to_string())?;
    if parsed.cannot_be_a_base() {
        return Err(format!("{base_url} cannot be used as a base URL"));
    }

    let normalized_base = parsed.path().trim_end_matches('/');
    let trimmed_path = path.trim_start_matches('/');

    let full_path = if normalized_base.is_empty() {
        format!("/{trimmed_path}")
    } else {
        format!("{normalized_base}/{trimmed_path}")
    };

    parsed.set_path(&full_path);
    parsed.set_query(None);
    parsed.set_fragment(None);

    Ok(parsed.to_string())
}
