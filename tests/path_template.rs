use chrono::{TimeZone, Utc};

use mailstash::layout::path_template::{
    content_hash, is_valid_layout, resolve_preset, sanitize_for_path, MessageVars, PathTemplate,
};

#[test]
fn content_hash_is_sha256_hex() {
    let h1 = content_hash(b"hello");
    let h2 = content_hash(b"hello");
    assert_eq!(h1, h2);
    assert_eq!(h1.len(), 64);
    assert_ne!(h1, content_hash(b"world"));
}

#[test]
fn sanitize_handles_the_usual_subjects() {
    assert_eq!(sanitize_for_path("Hello World", 30), "hello_world");
    assert_eq!(sanitize_for_path("Re: Meeting (notes)", 30), "meeting_notes");
    assert_eq!(sanitize_for_path("Re: Fwd: Re: deep", 30), "deep");
    assert_eq!(sanitize_for_path("a---b___c", 30), "a_b_c");
    assert_eq!(sanitize_for_path("Café résumé", 30), "caf_r_sum");
}

#[test]
fn sanitize_truncates_to_max_len() {
    let long = "word ".repeat(20);
    let out = sanitize_for_path(&long, 20);
    assert!(out.len() <= 20);
    assert!(!out.ends_with('_'));
}

#[test]
fn all_presets_resolve_to_templates() {
    for preset in ["default", "flat", "monthly", "daily", "compact", "hash2", "verbose"] {
        let resolved = resolve_preset(preset);
        assert!(resolved.contains('$'), "{preset} -> {resolved}");
        assert!(resolved.ends_with(".eml"));
        assert!(is_valid_layout(preset));
    }
    for legacy in ["tree:flat", "tree:month", "tree:day", "tree:year", "tree:hash2"] {
        assert!(resolve_preset(legacy).contains('$'));
        assert!(is_valid_layout(legacy));
    }
    assert!(is_valid_layout("sqlite"));
    assert!(is_valid_layout("$folder/$sha.eml"));
    assert!(!is_valid_layout("nonsense"));
}

#[test]
fn template_variables_expand() {
    let raw = b"some message bytes";
    let sha = content_hash(raw);
    let date = Utc.with_ymd_and_hms(2024, 3, 15, 14, 30, 5).unwrap();
    let vars = MessageVars {
        folder: "INBOX",
        raw,
        date: Some(date),
        subject: "Re: Quarterly Report",
        from_addr: "Alice <alice@example.com>",
        uid: Some(42),
    };
    let map = vars.to_map();

    assert_eq!(map["folder"], "INBOX");
    assert_eq!(map["sha"], sha);
    assert_eq!(map["sha8"], &sha[..8]);
    assert_eq!(map["sha2"], &sha[..2]);
    assert_eq!(map["yyyy"], "2024");
    assert_eq!(map["yy"], "24");
    assert_eq!(map["mm"], "03");
    assert_eq!(map["dd"], "15");
    assert_eq!(map["hh"], "14");
    assert_eq!(map["MM"], "30");
    assert_eq!(map["ss"], "05");
    assert_eq!(map["hhmmss"], "143005");
    assert_eq!(map["subj"], "quarterly_report");
    assert_eq!(map["subj10"], "quarterly");
    assert_eq!(map["uid"], "42");
}

#[test]
fn rendering_is_idempotent_for_fixed_vars() {
    let tpl = PathTemplate::new("verbose");
    let date = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 58).unwrap();
    let vars = MessageVars {
        folder: "Archive",
        raw: b"bytes",
        date: Some(date),
        subject: "Year End",
        from_addr: "alice@example.com",
        uid: None,
    };
    let a = tpl.render_message(&vars).unwrap();
    let b = tpl.render_message(&vars).unwrap();
    assert_eq!(a, b);
    assert!(a.starts_with("Archive/2023/12/31/2359_"));
}

#[test]
fn braced_and_bare_variables_both_work() {
    let tpl = PathTemplate::new("$folder/${sha8}_$uid.eml");
    let vars = MessageVars {
        folder: "INBOX",
        raw: b"x",
        date: None,
        subject: "",
        from_addr: "",
        uid: Some(7),
    };
    let rendered = tpl.render_message(&vars).unwrap();
    let sha8 = &content_hash(b"x")[..8];
    assert_eq!(rendered, format!("INBOX/{sha8}_7.eml"));
}

#[test]
fn undefined_variable_errors_instead_of_rendering() {
    let tpl = PathTemplate::new("$folder/$bogus.eml");
    let vars = MessageVars {
        folder: "INBOX",
        raw: b"x",
        date: None,
        subject: "",
        from_addr: "",
        uid: None,
    };
    let err = tpl.render_message(&vars).unwrap_err();
    assert!(err.to_string().contains("bogus"));
}
