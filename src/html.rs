//! HTML to plain-text stripping for notification bodies

use std::sync::LazyLock;

use regex::Regex;

static STYLE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").expect("valid regex"));
static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("valid regex"));
static BLOCK_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</p>|</div>|</tr>|</li>").expect("valid regex"));
static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));
static NUMERIC_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(\d{1,7});").expect("valid regex"));

/// Named entities decoded before `&amp;`
const NAMED_ENTITIES: [(&str, &str); 9] = [
    ("&nbsp;", " "),
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&apos;", "'"),
    ("&#39;", "'"),
    ("&hellip;", "..."),
    ("&mdash;", "\u{2014}"),
    ("&ndash;", "\u{2013}"),
];

/// Reduce an HTML body to readable plain text
///
/// Drops `<style>` and `<script>` blocks, turns line-ending tags into
/// newlines, removes remaining tags, decodes common entities, then trims
/// every line and discards blank ones.
pub fn strip_html(html: &str) -> String {
    if html.is_empty() {
        return String::new();
    }

    let text = STYLE_BLOCK.replace_all(html, "");
    let text = SCRIPT_BLOCK.replace_all(&text, "");
    let text = BLOCK_BREAK.replace_all(&text, "\n");
    let text = ANY_TAG.replace_all(&text, "");
    let text = decode_entities(&text);

    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(input: &str) -> String {
    let mut text = input.to_owned();
    for (entity, replacement) in NAMED_ENTITIES {
        if text.contains(entity) {
            text = text.replace(entity, replacement);
        }
    }
    let text = NUMERIC_ENTITY.replace_all(&text, |caps: &regex::Captures<'_>| {
        caps[1]
            .parse::<u32>()
            .ok()
            .and_then(char::from_u32)
            .map_or_else(|| caps[0].to_owned(), String::from)
    });
    // Last, so "&amp;lt;" stays a literal "&lt;"
    text.replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use std::sync::LazyLock;

    use super::{ANY_TAG, BLOCK_BREAK, NUMERIC_ENTITY, SCRIPT_BLOCK, STYLE_BLOCK, strip_html};

    #[test]
    fn every_pattern_compiles() {
        for pattern in [&STYLE_BLOCK, &SCRIPT_BLOCK, &BLOCK_BREAK, &ANY_TAG, &NUMERIC_ENTITY] {
            assert!(!LazyLock::force(pattern).as_str().is_empty());
        }
    }

    #[test]
    fn strips_inline_tags_and_script_blocks() {
        assert_eq!(
            strip_html("<p>Hi <b>there</b></p><script>x</script>"),
            "Hi there"
        );
    }

    #[test]
    fn block_tags_become_lines_and_blank_lines_collapse() {
        let html = "<div>First</div>\n\n<div>  Second  </div><br/><ul><li>a</li><li>b</li></ul>";
        assert_eq!(strip_html(html), "First\nSecond\na\nb");
    }

    #[test]
    fn removes_multiline_style_blocks_case_insensitively() {
        let html = "<STYLE type=\"text/css\">\np { color: red; }\n</STYLE><p>Body</p>";
        assert_eq!(strip_html(html), "Body");
    }

    #[test]
    fn decodes_common_entities() {
        assert_eq!(
            strip_html("<p>a&nbsp;&lt;b&gt; &quot;q&quot; &amp;lt; &#169;&hellip;</p>"),
            "a <b> \"q\" &lt; \u{a9}..."
        );
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert_eq!(strip_html(""), "");
        assert_eq!(strip_html("<br><br>"), "");
    }
}
