//! Tests for configuration loading and overrides.

use crate::{apply_env_overrides, load_from_path, EngineConfig};
use std::io::Write;

#[test]
fn defaults_match_documented_values() {
    let config = EngineConfig::default();

    assert!(!config.rules.allow_bikjang);
    assert!(!config.rules.board_based_repetitive_move);
    assert!(!config.rules.jang_move_is_illegal);

    assert_eq!(config.search.num_threads, 12);
    assert_eq!(config.search.search_num, 10_000);
    assert_eq!(config.search.search_time_ms, 10_000);
    assert_eq!(config.search.print_period_ms, 2_500);
    assert!(config.search.score_based_bias_rate.abs() < 1e-9);

    assert_eq!(config.inference.batch_size, 12);
    assert_eq!(config.inference.cache_size, 20_000);
    assert_eq!(config.inference.num_scheduler_threads, 0);

    assert!(!config.display.flip_display);
    assert!(config.display.verbose);
}

#[test]
fn partial_toml_fills_missing_fields_with_defaults() {
    let toml_str = r#"
        [search]
        num_threads = 4

        [rules]
        jang_move_is_illegal = true
    "#;

    let config: EngineConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(config.search.num_threads, 4);
    assert_eq!(config.search.search_num, 10_000);
    assert!(config.rules.jang_move_is_illegal);
    assert!(!config.rules.allow_bikjang);
    assert_eq!(config.inference.batch_size, 12);
}

#[test]
fn load_from_path_reads_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[inference]\nbatch_size = 8\ncache_size = 100\n\n[display]\nverbose = false\n"
    )
    .unwrap();

    let config = load_from_path(&file.path().to_path_buf());
    assert_eq!(config.inference.batch_size, 8);
    assert_eq!(config.inference.cache_size, 100);
    assert!(!config.display.verbose);
}

#[test]
fn malformed_toml_falls_back_to_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "this is not toml [[[").unwrap();

    let config = load_from_path(&file.path().to_path_buf());
    assert_eq!(config.search.num_threads, 12);
}

#[test]
fn env_overrides_take_precedence() {
    // Env vars are process-global, so pick keys no other test touches.
    std::env::set_var("JANGGI_SEARCH_SEARCH_NUM", "777");
    std::env::set_var("JANGGI_RULES_ALLOW_BIKJANG", "true");
    std::env::set_var("JANGGI_INFERENCE_CACHE_SIZE", "not-a-number");

    let config = apply_env_overrides(EngineConfig::default());

    assert_eq!(config.search.search_num, 777);
    assert!(config.rules.allow_bikjang);
    // Unparseable values are ignored.
    assert_eq!(config.inference.cache_size, 20_000);

    std::env::remove_var("JANGGI_SEARCH_SEARCH_NUM");
    std::env::remove_var("JANGGI_RULES_ALLOW_BIKJANG");
    std::env::remove_var("JANGGI_INFERENCE_CACHE_SIZE");
}
