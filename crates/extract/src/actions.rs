use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use url::Url;

use sitekb_common::{ActionKind, RiskLevel, SideEffect};

use crate::selector::stable_selector;
use crate::types::{ActionDraft, ActionExtraction, ExtractError, ExtractErrorKind, normalize_whitespace};

const WRITE_VERBS: [&str; 14] = [
    "delete", "remove", "submit", "buy", "pay", "checkout", "order", "cancel", "update", "save",
    "register", "subscribe", "send", "book",
];
const DESTRUCTIVE_VERBS: [&str; 4] = ["delete", "remove", "cancel", "clear"];
const PAYMENT_WORDS: [&str; 7] = ["pay", "purchase", "checkout", "buy", "order", "billing", "cart"];
const AUTH_WORDS: [&str; 6] = ["account", "profile", "logout", "dashboard", "admin", "sign out"];

fn contains_any(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

fn classify_category(text: &str) -> Option<&'static str> {
    if contains_any(text, &["buy", "cart", "checkout", "order", "pay", "purchase", "price"]) {
        Some("commerce")
    } else if contains_any(text, &["book", "reserve", "appointment", "schedule"]) {
        Some("booking")
    } else if contains_any(text, &["contact", "call us", "email us", "message"]) {
        Some("contact")
    } else if contains_any(text, &["search", "find"]) {
        Some("search")
    } else if contains_any(text, &["login", "log in", "sign in", "sign up", "register"]) {
        Some("auth")
    } else if contains_any(text, &["subscribe", "newsletter"]) {
        Some("newsletter")
    } else {
        None
    }
}

fn slugify(text: &str) -> String {
    let slug: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    let collapsed = slug
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    collapsed.chars().take(60).collect()
}

fn infer_side_effect(kind: ActionKind, text: &str) -> SideEffect {
    match kind {
        ActionKind::Navigation => SideEffect::Safe,
        _ if contains_any(text, &WRITE_VERBS) => SideEffect::Write,
        _ if contains_any(text, &["search", "find", "filter", "show"]) => SideEffect::Read,
        ActionKind::Form => SideEffect::Write,
        _ => SideEffect::Read,
    }
}

fn label_text(el: &ElementRef) -> String {
    let own: String = el.text().collect();
    let own = normalize_whitespace(&own);
    if !own.is_empty() {
        return own;
    }
    for attr in ["aria-label", "title", "value", "alt", "placeholder"] {
        if let Some(value) = el.value().attr(attr) {
            let value = normalize_whitespace(value);
            if !value.is_empty() {
                return value;
            }
        }
    }
    String::new()
}

fn draft_for(el: &ElementRef, kind: ActionKind, page_url: &str, index: usize) -> ActionDraft {
    let text = label_text(el);
    let lower = text.to_lowercase();

    let href = el
        .value()
        .attr("href")
        .filter(|h| !h.starts_with("javascript:") && *h != "#")
        .and_then(|h| match Url::parse(page_url) {
            Ok(base) => base.join(h).ok().map(|u| u.to_string()),
            Err(_) => Some(h.to_string()),
        });

    let destructive = contains_any(&lower, &DESTRUCTIVE_VERBS);
    let payment = contains_any(&lower, &PAYMENT_WORDS);
    let side_effecting = infer_side_effect(kind, &lower);
    let risk_level = if destructive || payment {
        RiskLevel::High
    } else if side_effecting == SideEffect::Write {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    let explicit_name = el
        .value()
        .attr("data-action")
        .or_else(|| el.value().attr("data-sitekb-action"))
        .map(slugify);
    let name = explicit_name
        .filter(|n| !n.is_empty())
        .or_else(|| {
            let slug = slugify(&text);
            if slug.is_empty() { None } else { Some(slug) }
        })
        .unwrap_or_else(|| format!("{}-{}", kind.as_str(), index));

    let description = match kind {
        ActionKind::Navigation => match &href {
            Some(target) => format!("Navigate to {target}"),
            None => format!("Navigate: {text}"),
        },
        ActionKind::Form => format!("Submit form: {text}"),
        ActionKind::Custom => format!("Site action: {text}"),
        _ => format!("Activate: {text}"),
    };

    ActionDraft {
        name,
        kind,
        description,
        selector: stable_selector(el),
        text,
        category: classify_category(&lower).map(|c| c.to_string()),
        side_effecting,
        risk_level,
        requires_confirmation: destructive || payment,
        requires_auth: contains_any(&lower, &AUTH_WORDS),
        source_url: page_url.to_string(),
        href,
    }
}

/// Discover interactive elements: links, buttons, submit inputs, forms,
/// and anything carrying a `data-action` attribute.
pub fn extract_actions(html: &str, page_url: &str) -> ActionExtraction {
    let doc = Html::parse_document(html);
    let mut actions: Vec<ActionDraft> = Vec::new();
    let mut seen = HashSet::new();
    let mut errors = Vec::new();

    let groups: [(&str, ActionKind); 4] = [
        ("a[href]", ActionKind::Navigation),
        (
            "button, input[type=\"submit\"], input[type=\"button\"]",
            ActionKind::Button,
        ),
        ("form", ActionKind::Form),
        ("[data-action], [data-sitekb-action]", ActionKind::Custom),
    ];

    for (css, kind) in groups {
        let selector = Selector::parse(css).unwrap();
        for el in doc.select(&selector) {
            let draft = draft_for(&el, kind, page_url, actions.len());
            if draft.text.is_empty() && draft.kind == ActionKind::Navigation {
                continue;
            }
            if !seen.insert(draft.selector.clone()) {
                continue;
            }
            if draft.name.is_empty() {
                errors.push(ExtractError::new(
                    ExtractErrorKind::Action,
                    format!("unnameable element at {}", draft.selector),
                ));
                continue;
            }
            actions.push(draft);
        }
    }

    ActionExtraction {
        actions,
        errors,
        extracted_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><body>
        <nav>
            <a href="/about">About us</a>
            <a href="/pricing">Pricing</a>
            <a href="https://twitter.com/acme">Twitter</a>
        </nav>
        <button id="add-to-cart">Add to cart</button>
        <button class="danger">Delete my account</button>
        <form id="contact-form"><input name="email"><button type="submit">Send message</button></form>
        <div data-action="open-chat">Chat with us</div>
    </body></html>"#;

    fn extract() -> ActionExtraction {
        extract_actions(PAGE, "https://acme.test/home")
    }

    #[test]
    fn links_are_safe_navigation() {
        let result = extract();
        let about = result.actions.iter().find(|a| a.name == "about-us").unwrap();
        assert_eq!(about.kind, ActionKind::Navigation);
        assert_eq!(about.side_effecting, SideEffect::Safe);
        assert_eq!(about.href.as_deref(), Some("https://acme.test/about"));
        assert_eq!(about.risk_level, RiskLevel::Low);
    }

    #[test]
    fn destructive_button_requires_confirmation() {
        let result = extract();
        let delete = result
            .actions
            .iter()
            .find(|a| a.text == "Delete my account")
            .unwrap();
        assert_eq!(delete.side_effecting, SideEffect::Write);
        assert!(delete.requires_confirmation);
        assert_eq!(delete.risk_level, RiskLevel::High);
        assert!(delete.requires_auth);
    }

    #[test]
    fn commerce_button_is_categorized() {
        let result = extract();
        let cart = result.actions.iter().find(|a| a.selector == "#add-to-cart").unwrap();
        assert_eq!(cart.category.as_deref(), Some("commerce"));
        assert!(cart.requires_confirmation);
    }

    #[test]
    fn data_action_attribute_names_the_action() {
        let result = extract();
        let chat = result.actions.iter().find(|a| a.kind == ActionKind::Custom).unwrap();
        assert_eq!(chat.name, "open-chat");
        assert_eq!(chat.selector, "[data-action=\"open-chat\"]");
    }

    #[test]
    fn selectors_are_deduplicated() {
        let result = extract();
        let mut selectors: Vec<&str> = result.actions.iter().map(|a| a.selector.as_str()).collect();
        let before = selectors.len();
        selectors.dedup();
        assert_eq!(before, selectors.len());
    }
}
