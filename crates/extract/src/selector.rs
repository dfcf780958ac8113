use scraper::ElementRef;

const MAX_STRUCTURAL_DEPTH: usize = 5;

/// Generate a stable CSS selector for an element. Precedence:
/// `id` > `name` > `data-action` > class path > structural path (depth ≤ 5).
pub fn stable_selector(el: &ElementRef) -> String {
    let value = el.value();

    if let Some(id) = value.attr("id") {
        if !id.trim().is_empty() {
            return format!("#{}", id.trim());
        }
    }
    if let Some(name) = value.attr("name") {
        if !name.trim().is_empty() {
            return format!("{}[name=\"{}\"]", value.name(), name.trim());
        }
    }
    for attr in ["data-action", "data-sitekb-action"] {
        if let Some(action) = value.attr(attr) {
            if !action.trim().is_empty() {
                return format!("[{}=\"{}\"]", attr, action.trim());
            }
        }
    }

    let classes: Vec<&str> = value.classes().collect();
    if !classes.is_empty() {
        return format!("{}.{}", value.name(), classes.join("."));
    }

    structural_path(el)
}

/// `tag:nth-child(n)` segments from the element upward, capped in depth.
fn structural_path(el: &ElementRef) -> String {
    let mut segments = Vec::new();
    let mut current = Some(*el);

    while let Some(element) = current {
        if segments.len() >= MAX_STRUCTURAL_DEPTH {
            break;
        }
        let position = element
            .prev_siblings()
            .filter(|sibling| sibling.value().is_element())
            .count()
            + 1;
        segments.push(format!("{}:nth-child({})", element.value().name(), position));

        if element.value().name() == "body" || element.value().name() == "html" {
            break;
        }
        current = element.parent().and_then(ElementRef::wrap);
    }

    segments.reverse();
    segments.join(" > ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::{Html, Selector};

    fn first(html: &str, css: &str) -> String {
        let doc = Html::parse_document(html);
        let selector = Selector::parse(css).unwrap();
        let el = doc.select(&selector).next().unwrap();
        stable_selector(&el)
    }

    #[test]
    fn id_wins() {
        let sel = first(
            r#"<button id="buy" name="b" class="btn" data-action="x">Buy</button>"#,
            "button",
        );
        assert_eq!(sel, "#buy");
    }

    #[test]
    fn name_beats_data_action() {
        let sel = first(
            r#"<input name="email" data-action="subscribe" class="field">"#,
            "input",
        );
        assert_eq!(sel, "input[name=\"email\"]");
    }

    #[test]
    fn data_action_beats_classes() {
        let sel = first(r#"<a data-action="open-cart" class="cart">Cart</a>"#, "a");
        assert_eq!(sel, "[data-action=\"open-cart\"]");
    }

    #[test]
    fn class_path_beats_structure() {
        let sel = first(r#"<button class="btn primary">Go</button>"#, "button");
        assert_eq!(sel, "button.btn.primary");
    }

    #[test]
    fn structural_fallback_is_bounded() {
        let html = r#"<div><div><div><div><div><div><span>deep</span></div></div></div></div></div></div>"#;
        let sel = first(html, "span");
        assert!(sel.ends_with("span:nth-child(1)"));
        assert!(sel.matches('>').count() < 6);
    }
}
