use chrono::Utc;
use scraper::{ElementRef, Html, Selector};

use crate::selector::stable_selector;
use crate::types::{
    ExtractError, ExtractErrorKind, ExtractedForm, FormExtraction, FormField, FormKind,
    normalize_whitespace,
};

fn sel(css: &str) -> Selector {
    Selector::parse(css).unwrap()
}

/// Label resolution order: `<label for>`, enclosing `<label>`, aria-label,
/// placeholder.
fn field_label(doc: &Html, field: &ElementRef) -> Option<String> {
    if let Some(id) = field.value().attr("id") {
        let label_sel = format!("label[for=\"{id}\"]");
        if let Ok(selector) = Selector::parse(&label_sel) {
            if let Some(label) = doc.select(&selector).next() {
                let text = normalize_whitespace(&label.text().collect::<String>());
                if !text.is_empty() {
                    return Some(text);
                }
            }
        };
    }

    let mut current = field.parent();
    while let Some(node) = current {
        if let Some(parent) = ElementRef::wrap(node) {
            if parent.value().name() == "label" {
                let text = normalize_whitespace(&parent.text().collect::<String>());
                if !text.is_empty() {
                    return Some(text);
                }
            }
            if parent.value().name() == "form" {
                break;
            }
            current = parent.parent();
        } else {
            break;
        }
    }

    for attr in ["aria-label", "placeholder"] {
        if let Some(value) = field.value().attr(attr) {
            let value = normalize_whitespace(value);
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

fn parse_u32(value: Option<&str>) -> Option<u32> {
    value.and_then(|v| v.parse().ok())
}

fn extract_field(doc: &Html, el: &ElementRef) -> Option<FormField> {
    let value = el.value();
    let tag = value.name();
    let field_type = match tag {
        "select" => "select".to_string(),
        "textarea" => "textarea".to_string(),
        _ => value.attr("type").unwrap_or("text").to_lowercase(),
    };
    if matches!(field_type.as_str(), "submit" | "button" | "image" | "reset") {
        return None;
    }

    let name = value
        .attr("name")
        .or_else(|| value.attr("id"))?
        .to_string();

    let options = if tag == "select" {
        el.select(&sel("option"))
            .map(|o| normalize_whitespace(&o.text().collect::<String>()))
            .filter(|o| !o.is_empty())
            .collect()
    } else {
        Vec::new()
    };

    Some(FormField {
        name,
        field_type,
        label: field_label(doc, el),
        required: value.attr("required").is_some(),
        disabled: value.attr("disabled").is_some(),
        readonly: value.attr("readonly").is_some(),
        pattern: value.attr("pattern").map(|p| p.to_string()),
        min: value.attr("min").map(|m| m.to_string()),
        max: value.attr("max").map(|m| m.to_string()),
        min_length: parse_u32(value.attr("minlength")),
        max_length: parse_u32(value.attr("maxlength")),
        options,
    })
}

/// Classify a form from its fields and surrounding text.
fn classify_form(fields: &[FormField], context: &str) -> FormKind {
    let names: Vec<String> = fields.iter().map(|f| f.name.to_lowercase()).collect();
    let types: Vec<&str> = fields.iter().map(|f| f.field_type.as_str()).collect();
    let has = |needle: &str| names.iter().any(|n| n.contains(needle)) || context.contains(needle);

    let has_password = types.contains(&"password");
    if has_password {
        if has("confirm") || has("register") || has("signup") || has("sign up") {
            return FormKind::Registration;
        }
        return FormKind::Login;
    }
    if types.contains(&"search") || has("search") || names.iter().any(|n| n == "q") {
        return FormKind::Search;
    }
    if has("card") || has("payment") || has("checkout") || has("billing") {
        return FormKind::Checkout;
    }
    if (types.contains(&"date") || types.contains(&"datetime-local")) && (has("book") || has("reserv") || has("appointment")) {
        return FormKind::Booking;
    }
    if has("newsletter") || (has("subscribe") && types.contains(&"email")) {
        return FormKind::Newsletter;
    }
    if has("feedback") || has("rating") || has("review") {
        return FormKind::Feedback;
    }
    if has("message") || has("contact") || types.contains(&"textarea") {
        return FormKind::Contact;
    }
    FormKind::Other
}

pub fn extract_forms(html: &str, page_url: &str) -> FormExtraction {
    let doc = Html::parse_document(html);
    let mut forms = Vec::new();
    let mut errors = Vec::new();

    for form_el in doc.select(&sel("form")) {
        let mut fields = Vec::new();
        for field_el in form_el.select(&sel("input, select, textarea")) {
            if let Some(field) = extract_field(&doc, &field_el) {
                fields.push(field);
            }
        }
        if fields.is_empty() {
            errors.push(ExtractError::new(
                ExtractErrorKind::Form,
                format!("form without fields at {}", stable_selector(&form_el)),
            ));
            continue;
        }

        let context = normalize_whitespace(&form_el.text().collect::<String>()).to_lowercase();
        let kind = classify_form(&fields, &context);
        forms.push(ExtractedForm {
            selector: stable_selector(&form_el),
            action: form_el.value().attr("action").map(|a| a.to_string()),
            method: form_el
                .value()
                .attr("method")
                .unwrap_or("get")
                .to_uppercase(),
            kind,
            name: form_el
                .value()
                .attr("name")
                .or_else(|| form_el.value().attr("id"))
                .map(|n| n.to_string()),
            fields,
            source_url: page_url.to_string(),
        });
    }

    FormExtraction {
        forms,
        errors,
        extracted_at: Utc::now(),
    }
}
