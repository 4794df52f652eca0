//! the args for running graft

use graft_cli_common::LoggingArgs;
use graft_ir::SplicePlan;
use graft_jit::OptLevel;
use std::path::PathBuf;

/// The args struct
#[derive(Debug, clap::Parser)]
#[clap(
    author,
    version,
    about = "Splices functions from one cranelift module into another, then runs them"
)]
pub struct Args {
    #[command(flatten)]
    logging: LoggingArgs,

    /// The module functions are spliced into
    #[clap(default_value = "module-a.clif", value_name = "module a", value_hint = clap::ValueHint::FilePath)]
    pub module_a: PathBuf,
    /// The module functions are taken from
    #[clap(default_value = "module-b.clif", value_name = "module b", value_hint = clap::ValueHint::FilePath)]
    pub module_b: PathBuf,
    /// Declarations to copy from module b into module a
    #[clap(long = "declare", value_name = "function", default_values = ["some_declaration"])]
    declare: Vec<String>,
    /// Functions of module a whose bodies are replaced with module b's
    #[clap(long = "replace", value_name = "function", default_values = ["foo", "callee", "foo_with_call"])]
    replace: Vec<String>,
    /// Functions of module a whose calls into module b are redirected to module a
    #[clap(long = "localize", value_name = "function", default_values = ["foo_with_call"])]
    localize: Vec<String>,
    /// Functions to run once spliced, each is called as `fn(i64) -> i32`
    #[clap(long = "run", value_name = "function", default_values = ["bar", "foo_with_call"])]
    pub run: Vec<String>,
    /// The argument every function is called with
    #[clap(long = "arg", default_value_t = 2, allow_negative_numbers = true)]
    pub arg: i64,
    /// How hard cranelift optimizes, one of `none`, `speed` or `speed_and_size`
    #[clap(long = "opt-level", default_value_t = OptLevel::Speed)]
    pub opt_level: OptLevel,
}

impl Args {
    /// The splice operations to perform
    pub fn plan(&self) -> SplicePlan {
        SplicePlan {
            declarations: self.declare.clone(),
            bodies: self.replace.clone(),
            localize: self.localize.clone(),
        }
    }

    pub fn logging(&self) -> &LoggingArgs {
        &self.logging
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::path::Path;

    #[test]
    fn test_defaults_are_the_demo() {
        let args = Args::try_parse_from(["graft"]).expect("could not parse test string");
        assert_eq!(args.module_a, Path::new("module-a.clif"));
        assert_eq!(args.module_b, Path::new("module-b.clif"));
        assert_eq!(args.plan(), SplicePlan::default());
        assert_eq!(args.run, ["bar", "foo_with_call"]);
        assert_eq!(args.arg, 2);
        assert_eq!(args.opt_level, OptLevel::Speed);
    }

    #[test]
    fn test_overrides() {
        let test = "graft a.clif b.clif --replace f --replace g --localize g --run g --arg -7 --opt-level speed_and_size -vv";
        let args = Args::try_parse_from(test.split(" ")).expect("could not parse test string");
        assert_eq!(args.module_a, Path::new("a.clif"));
        assert_eq!(args.module_b, Path::new("b.clif"));
        let plan = args.plan();
        assert_eq!(plan.declarations, ["some_declaration"]);
        assert_eq!(plan.bodies, ["f", "g"]);
        assert_eq!(plan.localize, ["g"]);
        assert_eq!(args.run, ["g"]);
        assert_eq!(args.arg, -7);
        assert_eq!(args.opt_level, OptLevel::SpeedAndSize);
        assert_eq!(args.logging().verbosity(), 2);
    }

    #[test]
    fn test_unknown_opt_level() {
        let test = "graft --opt-level aggressive";
        assert!(Args::try_parse_from(test.split(" ")).is_err());
    }
}
