use scraper::{Html, Selector};

/// Line width handed to html2text; snippets are collapsed to one line anyway.
const RENDER_WIDTH: usize = 4096;

/// Plain text from an HTML fragment: markup dropped, entities decoded,
/// whitespace collapsed to single spaces.
pub fn strip_html(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }

    match html2text::config::plain_no_decorate().string_from_read(html.as_bytes(), RENDER_WIDTH) {
        Ok(text) => text.split_whitespace().collect::<Vec<_>>().join(" "),
        Err(e) => {
            tracing::debug!(error = %e, "Failed to render HTML as text");
            String::new()
        }
    }
}

/// `src` of the first `<img>` carrying a non-empty one.
pub fn first_image_src(html: &str) -> Option<String> {
    let selector = Selector::parse("img[src]").ok()?;
    let fragment = Html::parse_fragment(html);

    fragment
        .select(&selector)
        .filter_map(|img| img.value().attr("src"))
        .map(str::trim)
        .find(|src| !src.is_empty())
        .map(str::to_string)
}
