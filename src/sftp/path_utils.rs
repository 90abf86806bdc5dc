//! Remote path utilities
//!
//! Remote SFTP paths always use `/` as separator (per SFTP protocol), so none
//! of this goes through `std::path`.

use crate::error::TransferError;
use crate::event::TransferEvent;

/// Suffix for staged uploads; a separate reaper may clean leftovers by this
pub const STAGING_SUFFIX: &str = ".relay-part";

/// Last `/`-separated segment of an object key.
///
/// Folder markers (`reports/`) and `.`/`..` have no usable basename.
pub fn object_basename(key: &str) -> Result<&str, TransferError> {
    let basename = key.rsplit('/').next().unwrap_or(key);
    if basename.is_empty() || basename == "." || basename == ".." {
        return Err(TransferError::InvalidEvent(format!(
            "object key {:?} does not name a file",
            key
        )));
    }
    Ok(basename)
}

/// Render the destination template for an event.
///
/// Placeholders: `{basename}`, `{key}` (full key) and `{bucket}`. The template
/// is scanned once, so braces inside substituted values stay literal. Any
/// `..` segment in the rendered path is rejected.
pub fn render_destination(template: &str, event: &TransferEvent) -> Result<String, TransferError> {
    let basename = object_basename(&event.object_key)?;

    if event.object_key.contains('\0') {
        return Err(TransferError::InvalidEvent("object key contains NUL".into()));
    }

    let placeholders = [
        ("{basename}", basename),
        ("{key}", event.object_key.trim_start_matches('/')),
        ("{bucket}", event.store_name.as_str()),
    ];

    let mut rendered = String::with_capacity(template.len() + event.object_key.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        rest = &rest[open..];

        match placeholders
            .iter()
            .find(|(token, _)| rest.starts_with(token))
        {
            Some((token, value)) => {
                rendered.push_str(value);
                rest = &rest[token.len()..];
            }
            None => {
                // Not a placeholder
                rendered.push('{');
                rest = &rest[1..];
            }
        }
    }
    rendered.push_str(rest);

    if rendered.split('/').any(|segment| segment == "..") {
        return Err(TransferError::InvalidEvent(format!(
            "object key {:?} escapes the destination directory",
            event.object_key
        )));
    }

    Ok(rendered)
}

/// Unique temp path next to the final destination.
///
/// Same directory so the final rename never crosses filesystems; random tag so
/// two deliveries of one event never write the same temp file.
pub fn staging_path(final_path: &str) -> String {
    let tag = uuid::Uuid::new_v4().simple().to_string();
    format!("{}.{}{}", final_path, &tag[..8], STAGING_SUFFIX)
}
