//! Templates in node labels, annotations and taints, like `rack-{{ .hostname }}`.
//!
//! Templates are rendered by minijinja with strict undefined handling, so referencing a field
//! which doesn't exist is an error instead of an empty string. Fields are written with a leading
//! dot (`{{ .hostname }}`), filters work as usual (`{{ .hostname | upper }}`).
use minijinja::{Environment, ErrorKind, UndefinedBehavior, syntax::SyntaxConfig};
use serde::Serialize;
use snafu::{ResultExt, Snafu};

use crate::config::{ClusterSpec, NodeSpec};

/// The fields a template may reference.
pub const TEMPLATE_FIELDS: &[&str] = &[
    "hostname",
    "ipAddress",
    "installDisk",
    "talosVersion",
    "kubernetesVersion",
    "clusterName",
    "role",
];

const VARIABLE_START: &str = "{{";
const VARIABLE_END: &str = "}}";
const BLOCK_START: &str = "{%";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to configure the template syntax"))]
    ConfigureSyntax { source: minijinja::Error },

    #[snafu(display("template {template:?} references an unknown field, expected one of {TEMPLATE_FIELDS:?}"))]
    UnknownField {
        source: minijinja::Error,
        template: String,
    },

    #[snafu(display("failed to render template {template:?}"))]
    RenderTemplate {
        source: minijinja::Error,
        template: String,
    },
}

fn environment() -> Result<Environment<'static>, Error> {
    let syntax = SyntaxConfig::builder()
        .variable_delimiters(VARIABLE_START, VARIABLE_END)
        .block_delimiters(BLOCK_START, "%}")
        .comment_delimiters("{#", "#}")
        .build()
        .context(ConfigureSyntaxSnafu)?;

    let mut env = Environment::new();
    env.set_syntax(syntax);
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    Ok(env)
}

/// Turns `.field` references inside `{{ ... }}` into plain variable names.
///
/// Attribute access (`a.b`) and quoted strings are left alone.
fn normalize(template: &str) -> String {
    let mut result = String::with_capacity(template.len());
    let mut remaining = template;

    while let Some(start) = remaining.find(VARIABLE_START) {
        result.push_str(&remaining[..start + VARIABLE_START.len()]);
        remaining = &remaining[start + VARIABLE_START.len()..];

        let Some(end) = remaining.find(VARIABLE_END) else {
            break;
        };
        result.push_str(&strip_field_dots(&remaining[..end]));
        result.push_str(VARIABLE_END);
        remaining = &remaining[end + VARIABLE_END.len()..];
    }

    result.push_str(remaining);
    result
}

fn strip_field_dots(expression: &str) -> String {
    let mut result = String::with_capacity(expression.len());
    let mut quote = None;
    let mut previous = None;
    let mut chars = expression.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(open) if c == open => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == '.'
                && previous.is_none_or(|p: char| p.is_whitespace() || "(|,".contains(p))
                && chars.peek().is_some_and(|next| next.is_ascii_alphabetic()) =>
            {
                previous = Some(c);
                continue;
            }
            None => {}
        }
        result.push(c);
        previous = Some(c);
    }
    result
}

/// Whether `value` contains template expressions at all.
pub fn is_template(value: &str) -> bool {
    value.contains(VARIABLE_START) || value.contains(BLOCK_START)
}

/// Checks that `template` is well formed and only references known fields.
pub fn check(template: &str) -> Result<(), Error> {
    TemplateContext::default().render(template).map(|_| ())
}

/// The values templates of one node are rendered with.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateContext {
    pub hostname: String,
    pub ip_address: String,
    pub install_disk: String,
    pub talos_version: String,
    pub kubernetes_version: String,
    pub cluster_name: String,
    pub role: String,
}

impl TemplateContext {
    pub fn for_node(node: &NodeSpec, cluster: &ClusterSpec) -> Self {
        Self {
            hostname: node.hostname.clone(),
            ip_address: node.addresses().first().map(ToString::to_string).unwrap_or_default(),
            install_disk: node.config.install_disk.clone().unwrap_or_default(),
            talos_version: cluster.talos_version.clone(),
            kubernetes_version: cluster.kubernetes_version.clone(),
            cluster_name: cluster.cluster_name.clone(),
            role: node.role().to_string(),
        }
    }

    pub fn render(&self, template: &str) -> Result<String, Error> {
        if !is_template(template) {
            return Ok(template.to_owned());
        }

        environment()?
            .render_str(&normalize(template), self)
            .map_err(|source| match source.kind() {
                ErrorKind::UndefinedError => Error::UnknownField {
                    source,
                    template: template.to_owned(),
                },
                _ => Error::RenderTemplate {
                    source,
                    template: template.to_owned(),
                },
            })
    }
}
