//! Gmail `format=full` payload shapes and body extraction.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use scraper::{Html, Node};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub attachment_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: PartBody,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl MessagePart {
    /// Case-insensitive header lookup; first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafPart {
    pub mime_type: String,
    pub data: Option<String>,
    pub is_attachment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimeNode {
    Leaf(LeafPart),
    Multipart {
        mime_type: String,
        children: Vec<MimeNode>,
    },
}

impl From<&MessagePart> for MimeNode {
    fn from(part: &MessagePart) -> Self {
        let mime_type = part.mime_type.to_ascii_lowercase();
        if mime_type.starts_with("multipart/") || !part.parts.is_empty() {
            MimeNode::Multipart {
                mime_type,
                children: part.parts.iter().map(MimeNode::from).collect(),
            }
        } else {
            MimeNode::Leaf(LeafPart {
                is_attachment: !part.filename.is_empty() || part.body.attachment_id.is_some(),
                data: part.body.data.clone(),
                mime_type,
            })
        }
    }
}

impl MimeNode {
    /// Depth-first, document-order fold over the leaves.
    pub fn fold<B, F>(&self, init: B, f: &mut F) -> B
    where
        F: FnMut(B, &LeafPart) -> B,
    {
        match self {
            MimeNode::Leaf(leaf) => f(init, leaf),
            MimeNode::Multipart { children, .. } => {
                children.iter().fold(init, |acc, child| child.fold(acc, &mut *f))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyParts {
    pub text: Option<String>,
    pub html: Option<String>,
    pub has_attachment: bool,
}

impl BodyParts {
    pub fn collect(root: &MimeNode) -> Self {
        root.fold(BodyParts::default(), &mut |mut acc: BodyParts, leaf: &LeafPart| {
            if leaf.is_attachment {
                acc.has_attachment = true;
                return acc;
            }
            let slot = match leaf.mime_type.as_str() {
                "text/plain" => &mut acc.text,
                "text/html" => &mut acc.html,
                _ => return acc,
            };
            if slot.is_none() {
                *slot = leaf.data.as_deref().and_then(decode_base64url);
            }
            acc
        })
    }

    /// Plain text when present, else the HTML part reduced to text.
    pub fn into_text(self) -> String {
        match (self.text, self.html) {
            (Some(text), _) => text.trim().to_string(),
            (None, Some(html)) => html_to_text(&html),
            (None, None) => String::new(),
        }
    }
}

/// Gmail sends URL-safe base64; padding and the standard alphabet are
/// tolerated as well.
pub fn decode_base64url(data: &str) -> Option<String> {
    let normalized: String = data
        .trim()
        .trim_end_matches('=')
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    let bytes = URL_SAFE_NO_PAD.decode(normalized).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut words: Vec<&str> = Vec::new();
    for node in document.root_element().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| e.name()))
            .is_some_and(|name| matches!(name, "script" | "style" | "head" | "title"));
        if hidden {
            continue;
        }
        words.extend(text.split_whitespace());
    }
    words.join(" ")
}
