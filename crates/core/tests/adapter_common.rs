//! End-to-end adapter behaviour on a tiny BERT-style host.
//!
//! Every test runs on CPU with random base weights. Round trips use twin
//! models that share base weights so outputs can be compared exactly.

use std::collections::BTreeMap;

use adapters_core::{
    adapters::{
        ActiveAdapters, AdapterConfig, AdapterConfigError, AdapterError, AdapterModel, AdapterSetup,
        BottleneckConfig, InjectionSlot, InvertibleConfig, InvertibleKind, LoadOptions, LoadingInfo,
        PrefixTuningConfig, ReductionFactor, CONFIG_NAME, HEAD_CONFIG_NAME, HEAD_WEIGHTS_NAME,
        WEIGHTS_NAME,
    },
    model::{HeadConfig, ModelWithHeads, TransformerModel},
    testing::{max_abs_diff, sample_input_ids, tiny_config, tiny_decoder_config, twin_models},
};
use candle_core::{DType, Device, Tensor};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn host() -> TransformerModel {
    TransformerModel::new(&tiny_config(), &Device::Cpu, DType::F32).unwrap()
}

fn ids() -> Tensor {
    sample_input_ids(2, 6, &Device::Cpu).unwrap()
}

fn family_configs() -> Vec<(&'static str, AdapterConfig)> {
    vec![
        ("pfeiffer", BottleneckConfig::pfeiffer().into()),
        ("houlsby", BottleneckConfig::houlsby().into()),
        ("prefix_tuning_flat", PrefixTuningConfig::flat().into()),
        ("mam", AdapterConfig::mam()),
    ]
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

#[test]
fn test_each_family_changes_output_when_active() {
    for (name, config) in family_configs() {
        let mut model = host();
        let baseline = model.forward(&ids()).unwrap();

        model.add_adapter(name, config).unwrap();
        let inactive = model.forward(&ids()).unwrap();
        assert_eq!(max_abs_diff(&baseline, &inactive).unwrap(), 0.0, "{name}");

        model.set_active_adapters(Some(name.into())).unwrap();
        let active = model.forward(&ids()).unwrap();
        assert_eq!(active.dims(), baseline.dims());
        assert!(
            max_abs_diff(&baseline, &active).unwrap() > 0.0,
            "{name} did not change the output"
        );
    }
}

#[test]
fn test_delete_removes_config_and_modules() {
    for (name, config) in family_configs() {
        let mut model = host();
        model.add_adapter(name, config).unwrap();
        model.set_active_adapters(Some(name.into())).unwrap();

        model.delete_adapter(name);
        assert!(model.config().adapters.get(name).is_none());
        assert!(model.get_adapter(name).is_empty());
        assert!(model.active_adapters().is_none());
        assert!(model.adapter_manager().named_parameters(name).is_err());
    }
}

#[test]
fn test_same_config_builds_same_layer_count() {
    let mut model = host();
    model.add_adapter("a", BottleneckConfig::houlsby().into()).unwrap();
    model.add_adapter("b", BottleneckConfig::houlsby().into()).unwrap();
    assert_eq!(model.get_adapter("a").len(), model.get_adapter("b").len());
    assert_eq!(model.get_adapter("a").len(), tiny_config().num_hidden_layers);
    assert_eq!(model.get_adapter("a")[0].len(), 2);
}

#[test]
fn test_duplicate_name_rejected() {
    let mut model = host();
    model.add_adapter("a", AdapterConfig::default()).unwrap();
    let err = model.add_adapter("a", AdapterConfig::mam()).unwrap_err();
    assert!(matches!(err, AdapterError::NameConflict(ref n) if n == "a"));
    assert_eq!(model.config().adapters.get("a"), Some(&AdapterConfig::default()));
}

#[test]
fn test_incompatible_slot_rejected_at_add() {
    let mut model = host();
    let config = BottleneckConfig {
        locations: vec![InjectionSlot::AttentionKeyValue],
        ..BottleneckConfig::pfeiffer()
    };
    let err = model.add_adapter("kv", config.into()).unwrap_err();
    assert!(matches!(
        err,
        AdapterError::Config(AdapterConfigError::IncompatibleSlot { .. })
    ));
    assert!(!model.adapter_manager().contains("kv"));
}

#[test]
fn test_every_registry_preset_attaches_and_serialises() {
    let mut model = host();
    for (name, config) in AdapterConfig::known_configs() {
        let name = name.replace('+', "_");
        model.add_adapter(&name, config).unwrap();
    }
    let json = model.config().to_json_string().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    let adapters = value["adapters"].as_object().unwrap();
    assert_eq!(adapters.len(), AdapterConfig::known_configs().count());
    assert_eq!(adapters["mam"]["architecture"], "union");
}

// ─── Reduction factors ───────────────────────────────────────────────────────

#[test]
fn test_per_layer_reduction_factor_with_default() {
    let factor: ReductionFactor = serde_json::from_str(r#"{"1": 1, "default": 2}"#).unwrap();
    let mut model = host();
    model
        .add_adapter(
            "rf",
            BottleneckConfig::pfeiffer().with_reduction_factor(factor).into(),
        )
        .unwrap();

    let layers = model.get_adapter("rf");
    let ratio = |layer: usize| {
        layers[layer]
            .bottleneck(InjectionSlot::PostFeedForward)
            .unwrap()
            .reduction_factor()
    };
    assert_eq!(ratio(0), 2.0);
    assert_eq!(ratio(1), 1.0);
}

#[test]
fn test_per_layer_reduction_factor_without_default_rejected() {
    let factor: ReductionFactor = serde_json::from_str(r#"{"2": 8, "4": 32}"#).unwrap();
    let mut model = host();
    let err = model
        .add_adapter(
            "rf",
            BottleneckConfig::pfeiffer().with_reduction_factor(factor).into(),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        AdapterError::Config(AdapterConfigError::InvalidReductionFactor { layer: 0 })
    ));
}

// ─── Activation ──────────────────────────────────────────────────────────────

#[test]
fn test_scoped_activation_matches_persistent() {
    let mut model = host();
    model.add_adapter("a", AdapterConfig::default()).unwrap();
    model.add_adapter("b", AdapterConfig::mam()).unwrap();

    let scoped = {
        let _setup = AdapterSetup::new(["a", "b"]);
        model.forward(&ids()).unwrap()
    };
    model.set_active_adapters(Some(["a", "b"].into())).unwrap();
    let persistent = model.forward(&ids()).unwrap();
    assert_eq!(max_abs_diff(&scoped, &persistent).unwrap(), 0.0);
}

#[test]
fn test_nested_scopes_restore_outer_selection() {
    let mut model = host();
    model.add_adapter("a", AdapterConfig::default()).unwrap();
    model.add_adapter("b", BottleneckConfig::houlsby().into()).unwrap();

    let baseline = model.forward(&ids()).unwrap();
    let only_a = model.forward_with_adapters(&ids(), "a").unwrap();
    let only_b = model.forward_with_adapters(&ids(), "b").unwrap();

    let _outer = AdapterSetup::new("a");
    {
        let _inner = AdapterSetup::new("b");
        let inner = model.forward(&ids()).unwrap();
        assert_eq!(max_abs_diff(&inner, &only_b).unwrap(), 0.0);
        {
            let _off = AdapterSetup::none();
            let off = model.forward(&ids()).unwrap();
            assert_eq!(max_abs_diff(&off, &baseline).unwrap(), 0.0);
        }
    }
    let outer = model.forward(&ids()).unwrap();
    assert_eq!(max_abs_diff(&outer, &only_a).unwrap(), 0.0);
}

#[test]
fn test_activating_unknown_adapter_rejected() {
    let mut model = host();
    let err = model
        .set_active_adapters(Some("missing".into()))
        .unwrap_err();
    assert!(matches!(err, AdapterError::AdapterNotFound(_)));
    assert!(model.active_adapters().is_none());
}

// ─── Invertible adapters ─────────────────────────────────────────────────────

#[test]
fn test_invertible_adapter_registered_and_removable() {
    let mut model = host();
    let config = BottleneckConfig::pfeiffer().with_invertible(InvertibleConfig::default());
    model.add_adapter("inv", config.into()).unwrap();
    model.set_active_adapters(Some("inv".into())).unwrap();

    let registered = model.invertible_adapters();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].0, "inv");
    assert!(std::ptr::eq(
        registered[0].1,
        model.get_invertible_adapter().unwrap()
    ));

    let params = model.adapter_manager().named_parameters("inv").unwrap();
    assert!(params.keys().any(|k| k.starts_with("invertible_adapters.inv.")));

    let with_inv = model.forward(&ids()).unwrap();
    assert!(model.remove_invertible_adapter("inv"));
    assert!(model.get_invertible_adapter().is_none());
    let without_inv = model.forward(&ids()).unwrap();
    assert!(max_abs_diff(&with_inv, &without_inv).unwrap() > 0.0);
}

// ─── Prefix ejection ─────────────────────────────────────────────────────────

#[test]
fn test_ejected_prefix_tuning_preserves_output() {
    let mut model = host();
    model
        .add_adapter("prefix", PrefixTuningConfig::default().into())
        .unwrap();
    model.set_active_adapters(Some("prefix".into())).unwrap();
    let before = model.forward(&ids()).unwrap();

    model.eject_prefix_tuning("prefix").unwrap();
    let after = model.forward(&ids()).unwrap();
    assert!(max_abs_diff(&before, &after).unwrap() < 1e-4);

    let params = model.adapter_manager().named_parameters("prefix").unwrap();
    assert_eq!(
        params.keys().collect::<Vec<_>>(),
        vec!["prefix_tunings.prefix.control_trans"]
    );
    assert_eq!(
        model.config().adapters["prefix"].prefix_tuning().map(|c| c.flat),
        Some(true)
    );
}

#[test]
fn test_eject_rejects_non_prefix_adapters() {
    let mut model = host();
    model.add_adapter("a", AdapterConfig::default()).unwrap();
    assert!(matches!(
        model.eject_prefix_tuning("a"),
        Err(AdapterError::NotPrefixTuning(_))
    ));
    assert!(matches!(
        model.eject_prefix_tuning("missing"),
        Err(AdapterError::AdapterNotFound(_))
    ));
}

// ─── Persistence ─────────────────────────────────────────────────────────────

fn assert_round_trip(config: AdapterConfig) {
    let (mut source, mut target) = twin_models(&tiny_config()).unwrap();
    source.add_adapter("rt", config).unwrap();
    assert_reloads_identically(&source, &mut target, "rt");
}

/// Save `name` from `source`, load it into `target` and compare outputs.
fn assert_reloads_identically(source: &TransformerModel, target: &mut TransformerModel, name: &str) {
    let expected = source.forward_with_adapters(&ids(), name).unwrap();

    let dir = tempfile::tempdir().unwrap();
    source.save_adapter(dir.path(), name, false).unwrap();
    assert!(dir.path().join(WEIGHTS_NAME).exists());
    assert!(dir.path().join(CONFIG_NAME).exists());

    let mut info = LoadingInfo::default();
    let loaded = target
        .load_adapter(
            dir.path(),
            LoadOptions::default().set_active(true),
            Some(&mut info),
        )
        .unwrap();
    assert_eq!(loaded, name);
    assert!(info.is_clean(), "{name}: {info:?}");
    assert_eq!(
        target.config().adapters.get(name),
        source.config().adapters.get(name)
    );

    let actual = target.forward(&ids()).unwrap();
    assert_eq!(max_abs_diff(&expected, &actual).unwrap(), 0.0, "{name}");
}

#[test]
fn test_round_trip_every_registry_preset() {
    for (_, config) in AdapterConfig::known_configs() {
        assert_round_trip(config);
    }
}

#[test]
fn test_round_trip_glow_invertible() {
    let inv = InvertibleConfig {
        kind: InvertibleKind::Glow,
        ..InvertibleConfig::default()
    };
    assert_round_trip(BottleneckConfig::houlsby().with_invertible(inv).into());
}

#[test]
fn test_round_trip_after_prefix_ejection() {
    for config in [PrefixTuningConfig::default().into(), AdapterConfig::mam()] {
        let (mut source, mut target) = twin_models(&tiny_config()).unwrap();
        source.add_adapter("ejected", config).unwrap();
        source.eject_prefix_tuning("ejected").unwrap();
        assert_reloads_identically(&source, &mut target, "ejected");
        assert_eq!(
            target.config().adapters["ejected"]
                .prefix_tuning()
                .map(|c| c.flat),
            Some(true)
        );
    }
}

#[test]
fn test_failed_head_load_detaches_adapter() {
    let (source, target) = twin_models(&tiny_config()).unwrap();
    let mut source = ModelWithHeads::new(source);
    source.add_adapter("a", AdapterConfig::default()).unwrap();
    source.add_classification_head("a", 2).unwrap();

    let dir = tempfile::tempdir().unwrap();
    source.save_adapter(dir.path(), "a", true).unwrap();
    std::fs::remove_file(dir.path().join(HEAD_WEIGHTS_NAME)).unwrap();

    let mut target = ModelWithHeads::new(target);
    target.add_adapter("other", AdapterConfig::default()).unwrap();
    target.set_active_adapters(Some("other".into())).unwrap();

    let mut info = LoadingInfo::default();
    let result = target.load_adapter(
        dir.path(),
        LoadOptions::default().set_active(true),
        Some(&mut info),
    );
    assert!(result.is_err());
    assert!(!target.adapter_manager().contains("a"));
    assert!(target.head("a").is_none());
    assert_eq!(target.active_adapters(), Some(&ActiveAdapters::from("other")));
    assert!(info.is_clean());
}

#[test]
fn test_load_as_renames_parameters() {
    let (mut source, mut target) = twin_models(&tiny_config()).unwrap();
    source.add_adapter("orig", AdapterConfig::default()).unwrap();
    let expected = source.forward_with_adapters(&ids(), "orig").unwrap();

    let dir = tempfile::tempdir().unwrap();
    source.save_adapter(dir.path(), "orig", false).unwrap();
    let name = target
        .load_adapter(dir.path(), LoadOptions::default().load_as("renamed"), None)
        .unwrap();
    assert_eq!(name, "renamed");
    assert!(target.adapter_manager().contains("renamed"));
    assert!(!target.adapter_manager().contains("orig"));
    assert!(target
        .adapter_manager()
        .named_parameters("renamed")
        .unwrap()
        .keys()
        .all(|k| !k.contains(".orig.")));

    let actual = target.forward_with_adapters(&ids(), "renamed").unwrap();
    assert_eq!(max_abs_diff(&expected, &actual).unwrap(), 0.0);
}

#[test]
fn test_load_into_conflicting_config_rejected() {
    let (mut source, mut target) = twin_models(&tiny_config()).unwrap();
    source.add_adapter("a", AdapterConfig::default()).unwrap();
    target.add_adapter("a", AdapterConfig::mam()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    source.save_adapter(dir.path(), "a", false).unwrap();
    let err = target
        .load_adapter(dir.path(), LoadOptions::default(), None)
        .unwrap_err();
    assert!(matches!(err, AdapterError::NameConflict(_)));
    assert_eq!(target.config().adapters["a"], AdapterConfig::mam());
}

#[test]
fn test_load_from_empty_directory_fails() {
    let mut model = host();
    let dir = tempfile::tempdir().unwrap();
    let err = model
        .load_adapter(dir.path(), LoadOptions::default(), None)
        .unwrap_err();
    assert!(matches!(err, AdapterError::LoadError(_)));
    assert!(model.adapter_manager().is_empty());
}

#[test]
fn test_head_wrapper_to_bare_model() {
    let (source, mut target) = twin_models(&tiny_config()).unwrap();
    let mut source = ModelWithHeads::new(source);
    source.add_adapter("a", AdapterConfig::mam()).unwrap();
    source.add_classification_head("a", 3).unwrap();
    let expected = source
        .transformer()
        .forward_with_adapters(&ids(), "a")
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    source.save_adapter(dir.path(), "a", true).unwrap();
    assert!(dir.path().join(HEAD_CONFIG_NAME).exists());

    let mut info = LoadingInfo::default();
    target
        .load_adapter(
            dir.path(),
            LoadOptions::default().set_active(true),
            Some(&mut info),
        )
        .unwrap();
    assert!(info.missing_keys.is_empty(), "{:?}", info.missing_keys);
    assert!(info.unexpected_keys.is_empty(), "{:?}", info.unexpected_keys);

    let actual = target.forward(&ids()).unwrap();
    assert_eq!(max_abs_diff(&expected, &actual).unwrap(), 0.0);
}

#[test]
fn test_bare_model_to_head_wrapper() {
    let (mut source, target) = twin_models(&tiny_config()).unwrap();
    source.add_adapter("a", BottleneckConfig::houlsby().into()).unwrap();
    let expected = source.forward_with_adapters(&ids(), "a").unwrap();

    let dir = tempfile::tempdir().unwrap();
    source.save_adapter(dir.path(), "a", true).unwrap();
    assert!(!dir.path().join(HEAD_CONFIG_NAME).exists());

    let mut target = ModelWithHeads::new(target);
    let mut info = LoadingInfo::default();
    target
        .load_adapter(
            dir.path(),
            LoadOptions::default().set_active(true),
            Some(&mut info),
        )
        .unwrap();
    assert!(info.is_clean(), "{info:?}");

    let output = target.forward(&ids()).unwrap();
    assert!(output.logits.is_none());
    assert_eq!(max_abs_diff(&expected, &output.hidden_states).unwrap(), 0.0);
}

#[test]
fn test_head_round_trip_between_wrappers() {
    let (source, target) = twin_models(&tiny_config()).unwrap();
    let mut source = ModelWithHeads::new(source);
    source.add_adapter("a", AdapterConfig::default()).unwrap();
    source.add_classification_head("a", 4).unwrap();
    source.set_active_adapters(Some("a".into())).unwrap();
    let expected = source.forward(&ids()).unwrap().logits.unwrap();

    let dir = tempfile::tempdir().unwrap();
    source.save_adapter(dir.path(), "a", true).unwrap();

    let mut target = ModelWithHeads::new(target);
    let mut info = LoadingInfo::default();
    target
        .load_adapter(
            dir.path(),
            LoadOptions::default().set_active(true),
            Some(&mut info),
        )
        .unwrap();
    assert!(info.is_clean(), "{info:?}");
    assert_eq!(target.head_names().collect::<Vec<_>>(), vec!["a"]);

    let actual = target.forward(&ids()).unwrap().logits.unwrap();
    assert_eq!(actual.dims(), &[2, 4]);
    assert_eq!(max_abs_diff(&expected, &actual).unwrap(), 0.0);
}

#[test]
fn test_loaded_prefix_adapter_decodes_incrementally() {
    let (source, target) = twin_models(&tiny_decoder_config()).unwrap();
    let mut source = ModelWithHeads::new(source);
    source.add_adapter("a", AdapterConfig::mam()).unwrap();
    source.add_head("a", HeadConfig::tagging(3)).unwrap();
    source.set_active_adapters(Some("a".into())).unwrap();
    let expected = source.forward(&ids()).unwrap().logits.unwrap();

    let dir = tempfile::tempdir().unwrap();
    source.save_adapter(dir.path(), "a", true).unwrap();
    let mut target = ModelWithHeads::new(target);
    target
        .load_adapter(dir.path(), LoadOptions::default().set_active(true), None)
        .unwrap();

    let ids = ids();
    let (first, past) = target
        .forward_with_past(&ids.narrow(1, 0, 4).unwrap(), None)
        .unwrap();
    let (rest, past) = target
        .forward_with_past(&ids.narrow(1, 4, 2).unwrap(), Some(&past))
        .unwrap();
    assert_eq!(past.seq_len(), 6);

    let incremental = Tensor::cat(&[first.logits.unwrap(), rest.logits.unwrap()], 1).unwrap();
    assert_eq!(incremental.dims(), &[2, 6, 3]);
    assert!(max_abs_diff(&expected, &incremental).unwrap() < 1e-4);
}

#[test]
fn test_save_all_adapters_respects_with_head() {
    let mut model = ModelWithHeads::new(host());
    model.add_adapter("with_head", AdapterConfig::default()).unwrap();
    model.add_adapter("no_head", PrefixTuningConfig::flat().into()).unwrap();
    model.add_classification_head("with_head", 2).unwrap();

    let dir = tempfile::tempdir().unwrap();
    model.save_all_adapters(dir.path(), true).unwrap();
    assert!(dir.path().join("with_head").join(CONFIG_NAME).exists());
    assert!(dir.path().join("with_head").join(HEAD_CONFIG_NAME).exists());
    assert!(dir.path().join("no_head").join(CONFIG_NAME).exists());
    assert!(!dir.path().join("no_head").join(HEAD_CONFIG_NAME).exists());

    let dir = tempfile::tempdir().unwrap();
    model.save_all_adapters(dir.path(), false).unwrap();
    for name in ["with_head", "no_head"] {
        assert!(dir.path().join(name).join(CONFIG_NAME).exists());
        assert!(!dir.path().join(name).join(HEAD_CONFIG_NAME).exists());
    }
}

#[test]
fn test_full_model_round_trip() {
    let mut model = host();
    model.add_adapter("a", AdapterConfig::default()).unwrap();
    model.add_adapter("m", AdapterConfig::mam()).unwrap();
    let expected = model.forward_with_adapters(&ids(), ["a", "m"]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    model.save_pretrained(dir.path()).unwrap();
    let restored = TransformerModel::from_pretrained(dir.path(), &Device::Cpu, DType::F32).unwrap();

    let names: Vec<String> = restored.config().adapters.into_keys().collect();
    assert_eq!(names, vec!["a", "m"]);
    assert_eq!(
        restored.base_weights().len(),
        model.base_weights().len()
    );
    let actual = restored.forward_with_adapters(&ids(), ["a", "m"]).unwrap();
    assert_eq!(max_abs_diff(&expected, &actual).unwrap(), 0.0);
}

#[test]
fn test_manifest_records_host_and_config() {
    let mut model = host();
    model.add_adapter("a", BottleneckConfig::parallel().into()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    model.save_adapter(dir.path(), "a", false).unwrap();

    let manifest = model.adapter_manager().loader().read_manifest(dir.path()).unwrap();
    assert_eq!(manifest.name, "a");
    assert_eq!(manifest.hidden_size, tiny_config().hidden_size);
    assert_eq!(manifest.num_hidden_layers, tiny_config().num_hidden_layers);
    assert_eq!(manifest.config, AdapterConfig::from(BottleneckConfig::parallel()));
    assert!(manifest.base_model_prefix.is_none());

    let tensors = candle_core::safetensors::load(dir.path().join(WEIGHTS_NAME), &Device::Cpu).unwrap();
    let keys: BTreeMap<_, _> = tensors.iter().map(|(k, t)| (k.clone(), t.dims().to_vec())).collect();
    assert!(keys.contains_key("encoder.layer.0.output.adapters.a.adapter_down.weight"));
    assert_eq!(keys["encoder.layer.0.output.adapters.a.adapter_down.weight"], vec![16, 32]);
}
