//! Rewrite of the decoded `AndroidManifest.xml` application entry point.
//!
//! apktool decodes the manifest to plain XML, so the patch is a single-attribute
//! rewrite: set `android:name` on the `<application>` element to the wrapper
//! class, adding the attribute when the original manifest never declared one.
//! Everything else passes through untouched.

use std::{fs, path::Path};

use quick_xml::{
    events::{BytesStart, Event},
    Reader, Writer,
};

use crate::Result;

const APPLICATION: &[u8] = b"application";
const ANDROID_NAME: &[u8] = b"android:name";

/// Set the application class in the decoded manifest at `path` to `class`.
///
/// # Errors
///
/// - [`crate::Error::FileError`] on I/O faults
/// - [`crate::Error::Xml`] for a manifest quick-xml cannot parse
/// - [`crate::Error::Malformed`] when the manifest has no `<application>` element
pub fn set_application_class(path: &Path, class: &str) -> Result<()> {
    let text = fs::read_to_string(path)?;
    let mut reader = Reader::from_str(&text);
    let mut writer = Writer::new(Vec::new());
    let mut patched = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == APPLICATION => {
                writer.write_event(Event::Start(with_wrapper_class(&e, class)?))?;
                patched = true;
            }
            Event::Empty(e) if e.name().as_ref() == APPLICATION => {
                writer.write_event(Event::Empty(with_wrapper_class(&e, class)?))?;
                patched = true;
            }
            Event::Eof => break,
            event => writer.write_event(event)?,
        }
    }

    if !patched {
        return Err(malformed_error!(
            "manifest {} has no <application> element",
            path.display()
        ));
    }

    fs::write(path, writer.into_inner())?;
    tracing::info!(manifest = %path.display(), class, "application entry point patched");
    Ok(())
}

fn with_wrapper_class(original: &BytesStart<'_>, class: &str) -> Result<BytesStart<'static>> {
    let mut element = BytesStart::new("application");
    for attr in original.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.as_ref() != ANDROID_NAME {
            element.push_attribute(attr);
        }
    }
    element.push_attribute(("android:name", class));
    Ok(element)
}
