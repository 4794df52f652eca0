//! A fixed sequence of splice operations between two modules

use crate::error::IrResult;
use crate::module::IrModule;
use tracing::{debug, info};

/// Which functions move from the source module into the target module.
///
/// Operations run in field order: declarations are cloned, then bodies are replaced, then the
/// calls of the listed functions are localized. The target is verified at the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplicePlan {
    /// Declarations copied from the source
    pub declarations: Vec<String>,
    /// Functions whose target body is replaced with the source body
    pub bodies: Vec<String>,
    /// Functions whose calls are redirected to the target's own functions
    pub localize: Vec<String>,
}

impl SplicePlan {
    /// Creates a plan that does nothing
    pub fn empty() -> Self {
        Self {
            declarations: vec![],
            bodies: vec![],
            localize: vec![],
        }
    }

    /// Applies this plan, modifying `target`
    pub fn apply(&self, target: &mut IrModule, source: &IrModule) -> IrResult<()> {
        debug!(
            "splicing {:?} into {:?} with {self:?}",
            source.name(),
            target.name()
        );
        for name in &self.declarations {
            target.clone_declaration(source, name)?;
        }
        for name in &self.bodies {
            target.replace_body(source, name)?;
        }
        let mut localized = 0;
        for name in &self.localize {
            localized += target.localize_calls(name)?;
        }
        target.verify()?;
        info!(
            "spliced {} declarations and {} bodies into {:?}, localizing {localized} calls",
            self.declarations.len(),
            self.bodies.len(),
            target.name()
        );
        Ok(())
    }
}

impl Default for SplicePlan {
    fn default() -> Self {
        Self {
            declarations: vec!["some_declaration".to_string()],
            bodies: ["foo", "callee", "foo_with_call"]
                .into_iter()
                .map(String::from)
                .collect(),
            localize: vec!["foo_with_call".to_string()],
        }
    }
}
