use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

use sitekb_common::{
    ActionDescriptor, ActionKind, ActionParameter, Capability, PrivacySettings, SecuritySettings,
    SiteId, SiteManifest, MANIFEST_SCHEMA_VERSION,
};

use crate::types::{content_hash, ActionDraft, ExtractedForm, FormField, FormKind};

/// Per-kind caps applied after ranking.
fn kind_cap(kind: ActionKind) -> usize {
    match kind {
        ActionKind::Navigation => 10,
        ActionKind::Button => 15,
        ActionKind::Form => 10,
        ActionKind::Api => 10,
        ActionKind::Custom => 10,
    }
}

const SENSITIVE_NAME_PARTS: [&str; 8] = [
    "password", "email", "phone", "ssn", "tax", "card", "secret", "token",
];

fn json_type_for_field(field_type: &str) -> (&'static str, Option<&'static str>) {
    match field_type {
        "number" | "range" => ("number", None),
        "checkbox" => ("boolean", None),
        "email" => ("string", Some("email")),
        "url" => ("string", Some("uri")),
        "date" => ("string", Some("date")),
        "datetime-local" => ("string", Some("date-time")),
        "time" => ("string", Some("time")),
        _ => ("string", None),
    }
}

fn parameter_from_field(field: &FormField) -> ActionParameter {
    ActionParameter {
        name: field.name.clone(),
        param_type: field.field_type.clone(),
        label: field.label.clone(),
        required: field.required,
        options: field.options.clone(),
        pattern: field.pattern.clone(),
        min_length: field.min_length,
        max_length: field.max_length,
    }
}

/// Draft 2020-12 object schema derived from the parameter list.
pub fn build_json_schema(parameters: &[ActionParameter]) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for param in parameters {
        let (json_type, format) = json_type_for_field(&param.param_type);
        let mut prop = serde_json::Map::new();
        prop.insert("type".to_string(), json!(json_type));
        if let Some(format) = format {
            prop.insert("format".to_string(), json!(format));
        }
        if let Some(label) = &param.label {
            prop.insert("description".to_string(), json!(label));
        }
        if !param.options.is_empty() {
            prop.insert("enum".to_string(), json!(param.options));
        }
        if let Some(pattern) = &param.pattern {
            prop.insert("pattern".to_string(), json!(pattern));
        }
        if let Some(min) = param.min_length {
            prop.insert("minLength".to_string(), json!(min));
        }
        if let Some(max) = param.max_length {
            prop.insert("maxLength".to_string(), json!(max));
        }
        properties.insert(param.name.clone(), Value::Object(prop));
        if param.required {
            required.push(param.name.clone());
        }
    }

    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

/// Structural argument validation against an action's parameter list.
/// Returns the list of violations; empty means valid.
pub fn validate_action_args(action: &ActionDescriptor, args: &Value) -> Vec<String> {
    let mut violations = Vec::new();
    let Some(obj) = args.as_object() else {
        return vec!["arguments must be an object".to_string()];
    };

    let known: HashSet<&str> = action.parameters.iter().map(|p| p.name.as_str()).collect();
    for key in obj.keys() {
        if !known.contains(key.as_str()) {
            violations.push(format!("unknown argument: {key}"));
        }
    }

    for param in &action.parameters {
        let value = obj.get(&param.name);
        let Some(value) = value else {
            if param.required {
                violations.push(format!("missing required argument: {}", param.name));
            }
            continue;
        };
        let (expected, _) = json_type_for_field(&param.param_type);
        let type_ok = match expected {
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            _ => value.is_string(),
        };
        if !type_ok {
            violations.push(format!("argument {} must be a {expected}", param.name));
            continue;
        }
        if !param.options.is_empty() {
            if let Some(s) = value.as_str() {
                if !param.options.iter().any(|o| o == s) {
                    violations.push(format!("argument {} not in allowed options", param.name));
                }
            }
        }
        if let (Some(min), Some(s)) = (param.min_length, value.as_str()) {
            if (s.chars().count() as u32) < min {
                violations.push(format!("argument {} shorter than {min}", param.name));
            }
        }
        if let (Some(max), Some(s)) = (param.max_length, value.as_str()) {
            if (s.chars().count() as u32) > max {
                violations.push(format!("argument {} longer than {max}", param.name));
            }
        }
    }
    violations
}

fn normalized_selector(selector: &str) -> String {
    selector.trim().to_lowercase()
}

/// Internal links outrank external, then richer labels win.
fn rank_key(draft: &ActionDraft, base_origin: Option<&str>) -> (u8, usize) {
    let internal = match (&draft.href, base_origin) {
        (Some(href), Some(origin)) => !href.starts_with(origin) as u8,
        _ => 0,
    };
    (internal, usize::MAX - draft.text.len().min(200))
}

pub struct ManifestGenerator {
    base_url: String,
    allowed_origins: Vec<String>,
}

impl ManifestGenerator {
    pub fn new(base_url: impl Into<String>, allowed_origins: Vec<String>) -> Self {
        Self {
            base_url: base_url.into(),
            allowed_origins,
        }
    }

    /// Compile the extracted actions and forms of a whole site into its
    /// manifest. `generated_at` is the owning session's finish time; the
    /// store assigns the version on upsert.
    pub fn generate(
        &self,
        site_id: &SiteId,
        drafts: &[ActionDraft],
        forms: &[ExtractedForm],
        generated_at: DateTime<Utc>,
    ) -> SiteManifest {
        let forms_by_selector: HashMap<String, &ExtractedForm> = forms
            .iter()
            .map(|f| (normalized_selector(&f.selector), f))
            .collect();

        // Dedupe by (selector, kind), keeping the first occurrence.
        let mut seen = HashSet::new();
        let mut per_kind: HashMap<ActionKind, Vec<&ActionDraft>> = HashMap::new();
        for draft in drafts {
            let key = (normalized_selector(&draft.selector), draft.kind);
            if seen.insert(key) {
                per_kind.entry(draft.kind).or_default().push(draft);
            }
        }

        let base_origin = url::Url::parse(&self.base_url)
            .ok()
            .map(|u| u.origin().ascii_serialization());

        let mut actions = Vec::new();
        let mut used_names = HashSet::new();
        for (kind, mut group) in per_kind {
            group.sort_by_key(|d| rank_key(d, base_origin.as_deref()));
            group.truncate(kind_cap(kind));
            for draft in group {
                actions.push(self.descriptor_for(draft, &forms_by_selector, &mut used_names));
            }
        }
        actions.sort_by(|a, b| a.kind.as_str().cmp(b.kind.as_str()).then(a.name.cmp(&b.name)));

        let capabilities = derive_capabilities(&actions, forms);
        let privacy_settings = derive_privacy(forms);
        let security_settings = SecuritySettings {
            allowed_origins: self.allowed_origins.clone(),
            require_https: self.base_url.starts_with("https://"),
            csrf_protection: true,
            allowed_methods: derive_methods(forms),
        };

        SiteManifest {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            site_id: site_id.clone(),
            version: 0,
            generated_at,
            actions,
            capabilities,
            security_settings,
            privacy_settings,
        }
    }

    fn descriptor_for(
        &self,
        draft: &ActionDraft,
        forms_by_selector: &HashMap<String, &ExtractedForm>,
        used_names: &mut HashSet<String>,
    ) -> ActionDescriptor {
        let parameters: Vec<ActionParameter> = if draft.kind == ActionKind::Form {
            forms_by_selector
                .get(&normalized_selector(&draft.selector))
                .map(|form| form.fields.iter().map(parameter_from_field).collect())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut name = draft.name.clone();
        let mut suffix = 2;
        while !used_names.insert(name.clone()) {
            name = format!("{}-{}", draft.name, suffix);
            suffix += 1;
        }

        // Content-derived id: stable across regenerations of an unchanged
        // site.
        let id = content_hash(&format!("{}|{}", draft.kind.as_str(), draft.selector))[..16].to_string();

        ActionDescriptor {
            id,
            name,
            kind: draft.kind,
            description: draft.description.clone(),
            selector: draft.selector.clone(),
            json_schema: build_json_schema(&parameters),
            parameters,
            side_effecting: draft.side_effecting,
            risk_level: draft.risk_level,
            requires_confirmation: draft.requires_confirmation,
            requires_auth: draft.requires_auth,
            category: draft.category.clone(),
            source_url: Some(draft.source_url.clone()),
        }
    }
}

fn derive_capabilities(actions: &[ActionDescriptor], forms: &[ExtractedForm]) -> Vec<Capability> {
    let mut capabilities = Vec::new();
    let form_kinds: HashSet<FormKind> = forms.iter().map(|f| f.kind).collect();
    let categories: HashSet<&str> = actions
        .iter()
        .filter_map(|a| a.category.as_deref())
        .collect();

    if actions.iter().any(|a| a.kind == ActionKind::Navigation) {
        capabilities.push(Capability::Navigation);
    }
    if form_kinds.contains(&FormKind::Search) || categories.contains("search") {
        capabilities.push(Capability::HasSearch);
    }
    if form_kinds.contains(&FormKind::Contact) {
        capabilities.push(Capability::HasContactForm);
    }
    if form_kinds.contains(&FormKind::Newsletter) {
        capabilities.push(Capability::HasNewsletter);
    }
    if form_kinds.contains(&FormKind::Checkout) || categories.contains("commerce") {
        capabilities.push(Capability::HasEcommerce);
    }
    if form_kinds.contains(&FormKind::Booking) || categories.contains("booking") {
        capabilities.push(Capability::HasBooking);
    }
    if form_kinds.contains(&FormKind::Login) || form_kinds.contains(&FormKind::Registration) {
        capabilities.push(Capability::HasAuthentication);
    }
    capabilities
}

fn derive_privacy(forms: &[ExtractedForm]) -> PrivacySettings {
    let mut sensitive_selectors = Vec::new();
    for form in forms {
        for field in &form.fields {
            let name = field.name.to_lowercase();
            let sensitive = field.field_type == "password"
                || SENSITIVE_NAME_PARTS.iter().any(|p| name.contains(p));
            if sensitive {
                sensitive_selectors.push(format!("{} [name=\"{}\"]", form.selector, field.name));
            }
        }
    }
    PrivacySettings {
        sensitive_selectors,
    }
}

fn derive_methods(forms: &[ExtractedForm]) -> Vec<String> {
    let mut methods: HashSet<String> = forms.iter().map(|f| f.method.clone()).collect();
    methods.insert("GET".to_string());
    let mut methods: Vec<String> = methods.into_iter().collect();
    methods.sort();
    methods
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::extract_actions;
    use crate::forms::extract_forms;

    const PAGE: &str = r#"<html><body>
        <nav>
            <a href="/about">About our company and team</a>
            <a href="/pricing">Pricing</a>
            <a href="https://elsewhere.example/partner">Partner site</a>
        </nav>
        <button id="add-to-cart">Add to cart</button>
        <form id="contact">
            <label for="em">Email address</label>
            <input id="em" name="email" type="email" required>
            <textarea name="message" required minlength="10"></textarea>
        </form>
        <form id="pwlogin"><input name="user"><input name="pw" type="password"></form>
    </body></html>"#;

    fn manifest() -> SiteManifest {
        let actions = extract_actions(PAGE, "https://acme.test/home");
        let forms = extract_forms(PAGE, "https://acme.test/home");
        let generator = ManifestGenerator::new("https://acme.test", vec!["https://acme.test".to_string()]);
        generator.generate(
            &SiteId::new("site-1"),
            &actions.actions,
            &forms.forms,
            Utc::now(),
        )
    }

    #[test]
    fn form_action_carries_parameters_and_schema() {
        let manifest = manifest();
        let contact = manifest
            .actions
            .iter()
            .find(|a| a.selector == "#contact")
            .unwrap();
        assert_eq!(contact.kind, ActionKind::Form);
        assert_eq!(contact.parameters.len(), 2);

        let schema = &contact.json_schema;
        assert_eq!(
            schema["$schema"],
            "https://json-schema.org/draft/2020-12/schema"
        );
        assert_eq!(schema["properties"]["email"]["format"], "email");
        assert!(schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .any(|r| r == "email"));
    }

    #[test]
    fn capabilities_are_derived() {
        let manifest = manifest();
        assert!(manifest.capabilities.contains(&Capability::Navigation));
        assert!(manifest.capabilities.contains(&Capability::HasContactForm));
        assert!(manifest.capabilities.contains(&Capability::HasEcommerce));
        assert!(manifest.capabilities.contains(&Capability::HasAuthentication));
    }

    #[test]
    fn sensitive_fields_are_flagged() {
        let manifest = manifest();
        let selectors = &manifest.privacy_settings.sensitive_selectors;
        assert!(selectors.iter().any(|s| s.contains("email")));
        assert!(selectors.iter().any(|s| s.contains("pw")));
    }

    #[test]
    fn security_settings_reflect_site() {
        let manifest = manifest();
        assert!(manifest.security_settings.require_https);
        assert_eq!(
            manifest.security_settings.allowed_origins,
            vec!["https://acme.test"]
        );
        assert!(manifest.security_settings.allowed_methods.contains(&"GET".to_string()));
    }

    #[test]
    fn ids_are_stable_across_regeneration() {
        let a = manifest();
        let b = manifest();
        let find = |m: &SiteManifest| m.actions.iter().find(|x| x.selector == "#contact").unwrap().id.clone();
        assert_eq!(find(&a), find(&b));
    }

    #[test]
    fn validator_checks_required_and_types() {
        let manifest = manifest();
        let contact = manifest
            .actions
            .iter()
            .find(|a| a.selector == "#contact")
            .unwrap();

        let ok = validate_action_args(
            contact,
            &json!({"email": "a@b.test", "message": "hello there, I need help"}),
        );
        assert!(ok.is_empty(), "unexpected violations: {ok:?}");

        let missing = validate_action_args(contact, &json!({"message": "hello there, friend"}));
        assert!(missing.iter().any(|v| v.contains("email")));

        let short = validate_action_args(contact, &json!({"email": "a@b.test", "message": "hi"}));
        assert!(short.iter().any(|v| v.contains("shorter")));

        let unknown = validate_action_args(contact, &json!({"email": "a@b.test", "message": "hello there, friend", "extra": 1}));
        assert!(unknown.iter().any(|v| v.contains("unknown")));
    }

    #[test]
    fn navigation_is_capped_and_internal_first() {
        let mut links = String::new();
        for i in 0..30 {
            links.push_str(&format!("<a href=\"/p{i}\">Internal page number {i}</a>"));
        }
        links.push_str("<a href=\"https://other.example/x\">External partner link</a>");
        let html = format!("<html><body>{links}</body></html>");
        let actions = extract_actions(&html, "https://acme.test/");
        let generator = ManifestGenerator::new("https://acme.test", vec![]);
        let manifest = generator.generate(&SiteId::new("s"), &actions.actions, &[], Utc::now());

        let nav: Vec<_> = manifest
            .actions
            .iter()
            .filter(|a| a.kind == ActionKind::Navigation)
            .collect();
        assert_eq!(nav.len(), 10);
        assert!(nav.iter().all(|a| a.source_url.as_deref() == Some("https://acme.test/")));
        assert!(nav
            .iter()
            .all(|a| !a.selector.contains("other.example")));
    }
}
