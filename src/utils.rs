use dicom_core::Tag;
use dicom_object::mem::InMemDicomObject;

/// Characters that cannot appear in a directory component on common
/// filesystems, plus spaces. All of them are replaced with `_`.
const FORBIDDEN_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|', ' '];

/// Turn a DICOM identity string into a safe path component.
///
/// Empty or blank input maps to `"Unknown"` so that files without a usable
/// patient identity still land somewhere predictable.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .trim_end_matches('\0')
        .chars()
        .map(|c| if FORBIDDEN_CHARS.contains(&c) { '_' } else { c })
        .collect();
    if cleaned.is_empty() {
        "Unknown".to_string()
    } else {
        cleaned
    }
}

/// Read an element as a trimmed string, or `None` if it is absent or not
/// representable as text. Trailing padding and NUL bytes are stripped.
pub fn element_str(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|elem| elem.to_str().ok())
        .map(|s| s.trim_end_matches('\0').trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Set up the global tracing subscriber.
///
/// `RUST_LOG` takes precedence; otherwise the verbose flag selects between
/// debug and warn level output. Safe to call more than once (the subscriber
/// can only be installed once per process).
pub fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(filter)
            .finish(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_forbidden_characters() {
        assert_eq!(sanitize_component("DOE/JOHN: 1?"), "DOE_JOHN__1_");
        assert_eq!(sanitize_component(r#"a\b*c"d<e>f|g"#), "a_b_c_d_e_f_g");
    }

    #[test]
    fn sanitize_maps_blank_to_unknown() {
        assert_eq!(sanitize_component(""), "Unknown");
        assert_eq!(sanitize_component("   "), "Unknown");
        assert_eq!(sanitize_component("\0"), "Unknown");
    }

    #[test]
    fn sanitize_keeps_ordinary_ids() {
        assert_eq!(sanitize_component("PAT_0042"), "PAT_0042");
    }
}
