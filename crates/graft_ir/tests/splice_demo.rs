use graft_ir::{IrContext, IrError, Reference, SplicePlan, VerifyError};
use std::path::{Path, PathBuf};
use test_log::test;

fn demo(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../demos")
        .join(name)
}

/// Splices the demo modules with the default plan
#[test]
fn test_splice_demo_modules() -> eyre::Result<()> {
    let context = IrContext::new();
    let mut module_a = context.read_module(demo("module-a.clif"))?;
    let module_b = context.read_module(demo("module-b.clif"))?;

    SplicePlan::default().apply(&mut module_a, &module_b)?;

    let names = module_a.functions().map(|(name, _)| name).collect::<Vec<_>>();
    assert_eq!(
        names,
        ["foo", "bar", "callee", "foo_with_call", "some_declaration"]
    );
    assert_eq!(module_a.is_declaration("some_declaration"), Some(true));
    for name in ["foo", "callee", "foo_with_call"] {
        let spliced = module_a.function(name).unwrap();
        let original = module_b.function(name).unwrap();
        assert_eq!(spliced.layout.blocks().count(), original.layout.blocks().count());
        assert_eq!(spliced.dfg.num_insts(), original.dfg.num_insts());
    }

    let foo_with_call = module_a.function("foo_with_call").unwrap();
    let references = foo_with_call
        .dfg
        .ext_funcs
        .keys()
        .filter_map(|func_ref| graft_ir::names::user_name(foo_with_call, func_ref))
        .map(|name| module_a.resolve(&name))
        .collect::<Vec<_>>();
    assert_eq!(references, [Reference::Local("callee".to_string())]);

    let printed = module_a.to_string();
    assert!(printed.starts_with("; module module-a"), "{printed}");
    Ok(())
}

/// Without localizing, the cloned call still targets module-b
#[test]
fn test_unlocalized_splice_fails_verification() {
    let context = IrContext::new();
    let mut module_a = context.read_module(demo("module-a.clif")).unwrap();
    let module_b = context.read_module(demo("module-b.clif")).unwrap();

    let plan = SplicePlan {
        localize: vec![],
        ..SplicePlan::default()
    };
    let error = plan
        .apply(&mut module_a, &module_b)
        .expect_err("foo_with_call calls into module-b");
    match error {
        IrError::Verify { module, errors } => {
            assert_eq!(module, "module-a");
            assert!(
                matches!(
                    &errors[..],
                    [VerifyError::ForeignReference { function, symbol, module }]
                        if function == "foo_with_call" && symbol == "callee" && module == "module-b"
                ),
                "got {errors:?}"
            );
        }
        other => panic!("unexpected error {other}"),
    }
}
