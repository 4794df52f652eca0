//! Rewriting the names functions use to refer to other functions

use cranelift::codegen::entity::PrimaryMap;
use cranelift::codegen::ir::{
    ExternalName, FuncRef, Function, GlobalValueData, Inst, InstructionData, SigRef,
    UserExternalName,
};
use std::collections::BTreeSet;

/// The name of a referenced symbol, as seen by [remap_external_names]
#[derive(Debug)]
pub enum ExternalSymbol<'a> {
    /// A `%name` reference, as written in clif text
    Testcase(&'a str),
    /// A numbered reference
    User(&'a UserExternalName),
}

/// What a referenced symbol should be renamed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameTarget {
    Testcase(String),
    User(UserExternalName),
}

/// Rewrites the name of every external function and global symbol value of `func`.
///
/// `map` returns `None` to leave a name untouched. Libcalls and known symbols are never passed
/// to `map`.
pub fn remap_external_names<E, F>(func: &mut Function, mut map: F) -> Result<(), E>
where
    F: FnMut(ExternalSymbol<'_>) -> Result<Option<NameTarget>, E>,
{
    let ext_funcs = func.dfg.ext_funcs.keys().collect::<Vec<_>>();
    for func_ref in ext_funcs {
        let name = func.dfg.ext_funcs[func_ref].name.clone();
        if let Some(renamed) = rename(func, &name, &mut map)? {
            func.dfg.ext_funcs[func_ref].name = renamed;
        }
    }

    let global_values = func.global_values.keys().collect::<Vec<_>>();
    for gv in global_values {
        let name = match &func.global_values[gv] {
            GlobalValueData::Symbol { name, .. } => name.clone(),
            _ => continue,
        };
        if let Some(renamed) = rename(func, &name, &mut map)? {
            if let GlobalValueData::Symbol { name, .. } = &mut func.global_values[gv] {
                *name = renamed;
            }
        }
    }
    Ok(())
}

fn rename<E, F>(func: &mut Function, name: &ExternalName, map: &mut F) -> Result<Option<ExternalName>, E>
where
    F: FnMut(ExternalSymbol<'_>) -> Result<Option<NameTarget>, E>,
{
    let target = match name {
        ExternalName::TestCase(testcase) => {
            let displayed = testcase.to_string();
            let symbol = displayed.strip_prefix('%').unwrap_or(&displayed);
            map(ExternalSymbol::Testcase(symbol))?
        }
        ExternalName::User(user_ref) => {
            let user = func.params.user_named_funcs()[*user_ref].clone();
            map(ExternalSymbol::User(&user))?
        }
        _ => None,
    };

    Ok(target.map(|target| match target {
        NameTarget::Testcase(name) => ExternalName::testcase(name),
        NameTarget::User(user) => ExternalName::User(func.declare_imported_user_function(user)),
    }))
}

/// Resolves the numbered name behind an external function, if it has one
pub fn user_name(func: &Function, func_ref: FuncRef) -> Option<UserExternalName> {
    match &func.dfg.ext_funcs[func_ref].name {
        ExternalName::User(user_ref) => Some(func.params.user_named_funcs()[*user_ref].clone()),
        _ => None,
    }
}

/// Every numbered name referenced by a global symbol value
pub fn symbol_value_names(func: &Function) -> Vec<UserExternalName> {
    func.global_values
        .values()
        .filter_map(|gv| match gv {
            GlobalValueData::Symbol {
                name: ExternalName::User(user_ref),
                ..
            } => Some(func.params.user_named_funcs()[*user_ref].clone()),
            _ => None,
        })
        .collect()
}

/// The external functions used by instructions of `func`, in order
pub fn used_func_refs(func: &Function) -> BTreeSet<FuncRef> {
    let mut used = BTreeSet::new();
    for block in func.layout.blocks() {
        for inst in func.layout.block_insts(block) {
            match func.dfg.insts[inst] {
                InstructionData::Call { func_ref, .. }
                | InstructionData::FuncAddr { func_ref, .. } => {
                    used.insert(func_ref);
                }
                _ => {}
            }
        }
    }
    used
}

/// Drops external functions that no instruction uses, renumbering the rest. Signatures left
/// without a user are dropped too, see [prune_signatures].
///
/// Returns how many external functions were dropped.
pub fn prune_external_functions(func: &mut Function) -> usize {
    let used = used_func_refs(func);
    let before = func.dfg.ext_funcs.len();
    if used.len() != before {
        let mut kept = PrimaryMap::new();
        let mut renumbered = vec![None; before];
        for (func_ref, data) in func.dfg.ext_funcs.iter() {
            if used.contains(&func_ref) {
                renumbered[func_ref.as_u32() as usize] = Some(kept.push(data.clone()));
            }
        }
        func.dfg.ext_funcs = kept;

        for inst in all_insts(func) {
            match &mut func.dfg.insts[inst] {
                InstructionData::Call { func_ref, .. }
                | InstructionData::FuncAddr { func_ref, .. } => {
                    if let Some(new_ref) = renumbered[func_ref.as_u32() as usize] {
                        *func_ref = new_ref;
                    }
                }
                _ => {}
            }
        }
    }
    prune_signatures(func);
    before - func.dfg.ext_funcs.len()
}

/// Drops signatures that neither an external function nor an indirect call uses, renumbering
/// the rest.
///
/// Returns how many were dropped.
pub fn prune_signatures(func: &mut Function) -> usize {
    let mut used = func
        .dfg
        .ext_funcs
        .values()
        .map(|data| data.signature)
        .collect::<BTreeSet<SigRef>>();
    for inst in all_insts(func) {
        if let InstructionData::CallIndirect { sig_ref, .. } = func.dfg.insts[inst] {
            used.insert(sig_ref);
        }
    }
    let before = func.dfg.signatures.len();
    if used.len() == before {
        return 0;
    }

    let mut kept = PrimaryMap::new();
    let mut renumbered = vec![None; before];
    for (sig_ref, signature) in func.dfg.signatures.iter() {
        if used.contains(&sig_ref) {
            renumbered[sig_ref.as_u32() as usize] = Some(kept.push(signature.clone()));
        }
    }
    func.dfg.signatures = kept;

    for data in func.dfg.ext_funcs.values_mut() {
        if let Some(new_ref) = renumbered[data.signature.as_u32() as usize] {
            data.signature = new_ref;
        }
    }
    for inst in all_insts(func) {
        if let InstructionData::CallIndirect { sig_ref, .. } = &mut func.dfg.insts[inst] {
            if let Some(new_ref) = renumbered[sig_ref.as_u32() as usize] {
                *sig_ref = new_ref;
            }
        }
    }
    before - func.dfg.signatures.len()
}

fn all_insts(func: &Function) -> Vec<Inst> {
    func.layout
        .blocks()
        .flat_map(|block| func.layout.block_insts(block))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_reader::parse_functions;
    use std::convert::Infallible;

    const CALLER: &str = r#"
function %caller(i64) -> i64 {
    gv0 = symbol %target
    fn0 = %unused(i64) -> i64
    fn1 = %target(i64) -> i64
block0(v0: i64):
    v1 = call fn1(v0)
    return v1
}
"#;

    fn caller() -> Function {
        parse_functions(CALLER).unwrap().remove(0)
    }

    fn names(func: &Function) -> Vec<String> {
        func.dfg
            .ext_funcs
            .values()
            .map(|data| match &data.name {
                ExternalName::TestCase(testcase) => testcase.to_string(),
                other => format!("{other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_remap_to_user_and_back() {
        let mut func = caller();
        let mut seen = vec![];
        remap_external_names::<Infallible, _>(&mut func, |symbol| {
            let ExternalSymbol::Testcase(symbol) = symbol else {
                panic!("only testcase names expected");
            };
            seen.push(symbol.to_string());
            Ok(Some(NameTarget::User(UserExternalName::new(7, seen.len() as u32))))
        })
        .unwrap();
        assert_eq!(seen, ["unused", "target", "target"]);
        assert_eq!(symbol_value_names(&func), [UserExternalName::new(7, 3)]);
        let fn1 = func.dfg.ext_funcs.keys().nth(1).unwrap();
        assert_eq!(user_name(&func, fn1), Some(UserExternalName::new(7, 2)));

        remap_external_names::<Infallible, _>(&mut func, |symbol| match symbol {
            ExternalSymbol::User(user) => Ok(Some(NameTarget::Testcase(format!("s{}", user.index)))),
            ExternalSymbol::Testcase(_) => Ok(None),
        })
        .unwrap();
        assert_eq!(names(&func), ["%s1", "%s2"]);
        assert_eq!(user_name(&func, fn1), None);
    }

    #[test]
    fn test_errors_stop_remapping() {
        let mut func = caller();
        let result = remap_external_names(&mut func, |_| Err("nope"));
        assert_eq!(result, Err("nope"));
    }

    #[test]
    fn test_prune_unused() {
        let mut func = caller();
        assert_eq!(used_func_refs(&func).len(), 1);
        assert_eq!(func.dfg.signatures.len(), 2);
        assert_eq!(prune_external_functions(&mut func), 1);
        assert_eq!(names(&func), ["%target"]);
        assert_eq!(func.dfg.signatures.len(), 1);
        assert_eq!(prune_external_functions(&mut func), 0);

        let flags = cranelift::codegen::settings::Flags::new(cranelift::codegen::settings::builder());
        cranelift::codegen::verify_function(&func, &flags).expect("pruned function should verify");
    }

    #[test]
    fn test_prune_keeps_indirect_signatures() {
        let mut func = parse_functions(
            r#"
function %indirect(i64, i64) -> i64 {
    sig0 = (i32) -> i32
    sig1 = (i64) -> i64
block0(v0: i64, v1: i64):
    v2 = call_indirect sig1, v1(v0)
    return v2
}
"#,
        )
        .unwrap()
        .remove(0);
        assert_eq!(prune_signatures(&mut func), 1);
        assert_eq!(func.dfg.signatures.len(), 1);
        let kept = func.dfg.signatures.values().next().unwrap();
        assert_eq!(kept.to_string(), "(i64) -> i64 fast");
        assert_eq!(prune_signatures(&mut func), 0);

        let flags = cranelift::codegen::settings::Flags::new(cranelift::codegen::settings::builder());
        cranelift::codegen::verify_function(&func, &flags).expect("renumbered call should verify");
    }
}
