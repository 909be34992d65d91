use handlebars::Handlebars;
use serde::Serialize;

use crate::error::Result;
use crate::models::{MatchResult, Severity, Subscription};

/// Incidents listed individually before the "... and N more" line.
pub const MAX_LISTED_INCIDENTS: usize = 10;

const SUBJECT: &str = "alert-subject";
const HTML_BODY: &str = "alert-html";
const SHORT_TEXT: &str = "alert-short-text";

/// A composed notification. Each channel picks the parts it can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
struct AlertContext<'a> {
    brand: &'a str,
    name: &'a str,
    zone: &'a str,
    location: &'a str,
    radius_km: f64,
    count: usize,
    high: Option<usize>,
    incidents: Vec<IncidentContext<'a>>,
    more: Option<usize>,
}

#[derive(Debug, Serialize)]
struct IncidentContext<'a> {
    category: &'a str,
    severity: &'static str,
    severity_class: String,
    date: String,
    address: &'a str,
    distance_km: f64,
    description: &'a str,
}

/// Subject, HTML and SMS templates, registered once and rendered per
/// notification. Values in `{{ }}` are HTML-escaped; plain-text parts use
/// `{{{ }}}`.
pub struct MessageTemplates {
    registry: Handlebars<'static>,
}

impl MessageTemplates {
    pub fn new() -> Result<Self> {
        let mut registry = Handlebars::new();

        registry.register_template_string(SUBJECT, "{{{brand}}} Alert: {{{name}}}")?;
        registry.register_template_string(
            SHORT_TEXT,
            "{{{brand}}} Alert: {{count}} new incident(s) detected near {{{zone}}}\
             {{#if high}} ({{high}} high severity){{/if}}. Check the app for details. Stay safe!",
        )?;
        registry.register_template_string(
            HTML_BODY,
            r#"<html><body>
<h1>{{brand}} Alert: {{name}}</h1>
<p>Activity detected in your monitored area</p>
<p>We've detected {{count}} new incident(s) in your monitored area: <strong>{{location}}</strong></p>
<h3>Recent Incidents:</h3>
{{#each incidents}}
<div class="incident severity-{{severity_class}}">
<h4>{{category}} - {{severity}} Severity</h4>
<p><strong>Date:</strong> {{date}}</p>
<p><strong>Location:</strong> {{address}}</p>
<p><strong>Distance:</strong> {{distance_km}} km from your alert location</p>
<p><strong>Description:</strong> {{description}}</p>
</div>
{{/each}}
{{#if more}}
<p><em>... and {{more}} more incidents</em></p>
{{/if}}
<p>This alert was generated for: {{name}}</p>
<p>Alert radius: {{radius_km}} km</p>
</body></html>"#,
        )?;

        Ok(Self { registry })
    }

    /// Builds the notification for one subscription and its fresh matches.
    /// The HTML lists the newest incidents first.
    pub fn compose(&self, brand: &str, sub: &Subscription, matches: &[MatchResult]) -> Result<Message> {
        let context = alert_context(brand, sub, matches);
        Ok(Message {
            subject: self.registry.render(SUBJECT, &context)?,
            html: self.registry.render(HTML_BODY, &context)?,
            text: self.registry.render(SHORT_TEXT, &context)?,
        })
    }

    /// One-line summary sized for SMS.
    pub fn short_text(&self, brand: &str, sub: &Subscription, matches: &[MatchResult]) -> Result<String> {
        let context = alert_context(brand, sub, matches);
        Ok(self.registry.render(SHORT_TEXT, &context)?)
    }
}

fn alert_context<'a>(brand: &'a str, sub: &'a Subscription, matches: &'a [MatchResult]) -> AlertContext<'a> {
    let mut ordered: Vec<&MatchResult> = matches.iter().collect();
    ordered.sort_by(|a, b| b.incident.occurred_at.cmp(&a.incident.occurred_at));

    let high = matches
        .iter()
        .filter(|m| m.incident.severity == Severity::High)
        .count();
    let incidents = ordered
        .iter()
        .take(MAX_LISTED_INCIDENTS)
        .map(|m| IncidentContext {
            category: &m.incident.category,
            severity: m.incident.severity.as_str(),
            severity_class: m.incident.severity.as_str().to_ascii_lowercase(),
            date: m.incident.occurred_at.format("%Y-%m-%d %H:%M").to_string(),
            address: m.incident.location.address.as_deref().unwrap_or("Unknown"),
            distance_km: m.display_distance_km(),
            description: &m.incident.description,
        })
        .collect();

    AlertContext {
        brand,
        name: &sub.name,
        zone: sub.zone_label(),
        location: sub.location_label.as_deref().unwrap_or("Unknown location"),
        radius_km: sub.radius_km,
        count: matches.len(),
        high: (high > 0).then_some(high),
        incidents,
        more: (matches.len() > MAX_LISTED_INCIDENTS).then(|| matches.len() - MAX_LISTED_INCIDENTS),
    }
}
