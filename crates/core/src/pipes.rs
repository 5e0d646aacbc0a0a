//! Builtin pipes and analyses.
//!
//! These are deliberately small, deterministic stand-ins for the real
//! transformation tools (lifter, isolator, decompiler): the engine
//! schedules and caches them, it does not analyze binaries itself. Each one
//! is a faithful exercise of the pipe contract machinery, so they double as
//! the default pipeline wired by `default_registry` and as realistic test
//! subjects.

use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::global::{GlobalsMap, TreeGlobal};
use crate::container::{ContainerSet, Payload};
use crate::pipe::{
    requirement_target, Analysis, AnalysisOptions, Contract, Pipe, PipeContext, StagedContainers,
};
use crate::target::{ContainerToTargetsMap, KindRef, PathComponent};

fn function_name(model: &TreeGlobal, address: &str) -> String {
    model.value()["Functions"][address]["Name"].as_str().unwrap_or("").to_string()
}

/// Source pipe seeding the input container from the model Global.
///
/// Stands in for reading the raw binary off disk: the payload is the
/// canonical serialization of the model, so identical models always produce
/// identical inputs.
pub struct ImportBinaryPipe {
    global_name: String,
    output_container: String,
    kind: KindRef,
}

impl ImportBinaryPipe {
    pub fn new(global_name: impl Into<String>, output_container: impl Into<String>, kind: KindRef) -> Self {
        Self {
            global_name: global_name.into(),
            output_container: output_container.into(),
            kind,
        }
    }
}

impl Pipe for ImportBinaryPipe {
    fn name(&self) -> &str {
        "import-binary"
    }

    fn contracts(&self) -> Vec<Contract> {
        vec![Contract::source(&self.output_container, self.kind.name())]
    }

    fn run(
        &self,
        ctx: &PipeContext<'_>,
        request: &ContainerToTargetsMap,
        io: &mut StagedContainers<'_>,
    ) -> EngineResult<()> {
        let Some(targets) = request.targets(&self.output_container) else {
            return Ok(());
        };
        let model = ctx.globals().get(&self.global_name)?;
        let payload = Payload::Text(model.serialize()?);
        for target in targets {
            io.insert(&self.output_container, target.clone(), payload.clone())?;
        }
        Ok(())
    }
}

/// Lifts the imported binary into a whole-module intermediate form.
pub struct LiftPipe {
    input_container: String,
    output_container: String,
    kind: KindRef,
}

impl LiftPipe {
    pub fn new(
        input_container: impl Into<String>,
        output_container: impl Into<String>,
        kind: KindRef,
    ) -> Self {
        Self {
            input_container: input_container.into(),
            output_container: output_container.into(),
            kind,
        }
    }
}

impl Pipe for LiftPipe {
    fn name(&self) -> &str {
        "lift"
    }

    fn contracts(&self) -> Vec<Contract> {
        vec![Contract::new(
            &self.input_container,
            self.kind.name(),
            &self.output_container,
            self.kind.name(),
        )]
    }

    fn run(
        &self,
        _ctx: &PipeContext<'_>,
        request: &ContainerToTargetsMap,
        io: &mut StagedContainers<'_>,
    ) -> EngineResult<()> {
        let Some(targets) = request.targets(&self.output_container) else {
            return Ok(());
        };
        for target in targets.clone() {
            let input = io.get(&self.input_container, &target)?.ok_or_else(|| {
                EngineError::pipe(self.name(), format!("missing input for target '{target}'"))
            })?;
            let Payload::Text(text) = input else {
                return Err(EngineError::pipe(self.name(), "expected a text input payload"));
            };
            let lifted = Payload::Text(format!("; lifted module\n{text}\n"));
            io.insert(&self.output_container, target, lifted)?;
        }
        Ok(())
    }
}

/// Splits the lifted module into one entry per function.
pub struct IsolatePipe {
    input_container: String,
    input_kind: KindRef,
    output_container: String,
    function_kind: KindRef,
    global_name: String,
}

impl IsolatePipe {
    pub fn new(
        input_container: impl Into<String>,
        input_kind: KindRef,
        output_container: impl Into<String>,
        function_kind: KindRef,
        global_name: impl Into<String>,
    ) -> Self {
        Self {
            input_container: input_container.into(),
            input_kind,
            output_container: output_container.into(),
            function_kind,
            global_name: global_name.into(),
        }
    }
}

impl Pipe for IsolatePipe {
    fn name(&self) -> &str {
        "isolate"
    }

    fn contracts(&self) -> Vec<Contract> {
        vec![Contract::new(
            &self.input_container,
            self.input_kind.name(),
            &self.output_container,
            self.function_kind.name(),
        )]
    }

    fn run(
        &self,
        ctx: &PipeContext<'_>,
        request: &ContainerToTargetsMap,
        io: &mut StagedContainers<'_>,
    ) -> EngineResult<()> {
        let Some(targets) = request.targets(&self.output_container) else {
            return Ok(());
        };
        let model = ctx.globals().get_as::<TreeGlobal>(&self.global_name)?;
        for target in targets.clone() {
            let module_target = requirement_target(&target, &self.input_kind)?;
            if !io.contains(&self.input_container, &module_target)? {
                return Err(EngineError::pipe(
                    self.name(),
                    format!("missing lifted module for target '{target}'"),
                ));
            }
            let address = match target.components() {
                [PathComponent::Exact(address)] => address.clone(),
                _ => {
                    return Err(EngineError::pipe(
                        self.name(),
                        format!("target '{target}' is not a concrete function address"),
                    ))
                }
            };
            let name = function_name(model, &address);
            let body = Payload::Text(format!("function {name} at {address}\n"));
            io.insert(&self.output_container, target, body)?;
        }
        Ok(())
    }
}

/// Renders the isolated function into decompiled pseudo-C.
pub struct DecompilePipe {
    input_container: String,
    output_container: String,
    kind: KindRef,
}

impl DecompilePipe {
    pub fn new(
        input_container: impl Into<String>,
        output_container: impl Into<String>,
        kind: KindRef,
    ) -> Self {
        Self {
            input_container: input_container.into(),
            output_container: output_container.into(),
            kind,
        }
    }
}

impl Pipe for DecompilePipe {
    fn name(&self) -> &str {
        "decompile"
    }

    fn contracts(&self) -> Vec<Contract> {
        vec![Contract::new(
            &self.input_container,
            self.kind.name(),
            &self.output_container,
            self.kind.name(),
        )]
    }

    fn run(
        &self,
        _ctx: &PipeContext<'_>,
        request: &ContainerToTargetsMap,
        io: &mut StagedContainers<'_>,
    ) -> EngineResult<()> {
        let Some(targets) = request.targets(&self.output_container) else {
            return Ok(());
        };
        for target in targets.clone() {
            let input = io.get(&self.input_container, &target)?.ok_or_else(|| {
                EngineError::pipe(self.name(), format!("missing isolated function '{target}'"))
            })?;
            let Payload::Text(text) = input else {
                return Err(EngineError::pipe(self.name(), "expected a text input payload"));
            };
            let address = target.to_string().replace([':', '/'], "_");
            let decompiled =
                Payload::Text(format!("void fn_{address}(void) {{\n  /* {} */\n}}\n", text.trim()));
            io.insert(&self.output_container, target, decompiled)?;
        }
        Ok(())
    }
}

/// Renames one function in the model.
///
/// Options: `address` (key under `Functions`) and `name` (the new name).
pub struct RenameFunctionAnalysis {
    global_name: String,
}

impl RenameFunctionAnalysis {
    pub fn new(global_name: impl Into<String>) -> Self {
        Self { global_name: global_name.into() }
    }
}

impl Analysis for RenameFunctionAnalysis {
    fn name(&self) -> &str {
        "rename-function"
    }

    // Requires an address and a name; meaningless in a batch run.
    fn runs_unattended(&self) -> bool {
        false
    }

    fn run(
        &self,
        options: &AnalysisOptions,
        _containers: &ContainerSet,
        globals: &mut GlobalsMap,
    ) -> EngineResult<()> {
        let address = options.get("address").ok_or_else(|| {
            EngineError::InvalidRequest("analysis 'rename-function' requires option 'address'".into())
        })?;
        let new_name = options.get("name").ok_or_else(|| {
            EngineError::InvalidRequest("analysis 'rename-function' requires option 'name'".into())
        })?;

        let model = globals.get_as_mut::<TreeGlobal>(&self.global_name)?;
        let function = model
            .value_mut()
            .get_mut("Functions")
            .and_then(|functions| functions.get_mut(address))
            .ok_or_else(|| {
                EngineError::InvalidRequest(format!("no function at address '{address}'"))
            })?;
        function["Name"] = Value::String(new_name.clone());
        Ok(())
    }
}

/// Lowercases every function name in the model.
pub struct NormalizeFunctionNamesAnalysis {
    global_name: String,
}

impl NormalizeFunctionNamesAnalysis {
    pub fn new(global_name: impl Into<String>) -> Self {
        Self { global_name: global_name.into() }
    }
}

impl Analysis for NormalizeFunctionNamesAnalysis {
    fn name(&self) -> &str {
        "normalize-function-names"
    }

    fn run(
        &self,
        _options: &AnalysisOptions,
        _containers: &ContainerSet,
        globals: &mut GlobalsMap,
    ) -> EngineResult<()> {
        let model = globals.get_as_mut::<TreeGlobal>(&self.global_name)?;
        let Some(functions) = model.value_mut().get_mut("Functions").and_then(Value::as_object_mut)
        else {
            return Ok(());
        };
        for function in functions.values_mut() {
            if let Some(name) = function.get("Name").and_then(Value::as_str) {
                let normalized = name.to_lowercase();
                function["Name"] = Value::String(normalized);
            }
        }
        Ok(())
    }
}

/// Pipes with observable execution, used by tests to assert cache behavior.
pub mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Copies targets from one container to another, counting invocations
    /// that actually had work to do.
    pub struct CountingPipe {
        name: String,
        input: Option<(String, KindRef)>,
        output_container: String,
        output_kind: KindRef,
        calls: Arc<AtomicUsize>,
        payload: String,
    }

    impl CountingPipe {
        /// A source variant producing `payload` for every requested target.
        pub fn source(
            name: impl Into<String>,
            output_container: impl Into<String>,
            output_kind: KindRef,
            payload: impl Into<String>,
        ) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let pipe = Self {
                name: name.into(),
                input: None,
                output_container: output_container.into(),
                output_kind,
                calls: Arc::clone(&calls),
                payload: payload.into(),
            };
            (pipe, calls)
        }

        /// A transforming variant reading the ancestor input target.
        pub fn transform(
            name: impl Into<String>,
            input_container: impl Into<String>,
            input_kind: KindRef,
            output_container: impl Into<String>,
            output_kind: KindRef,
        ) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let pipe = Self {
                name: name.into(),
                input: Some((input_container.into(), input_kind)),
                output_container: output_container.into(),
                output_kind,
                calls: Arc::clone(&calls),
                payload: String::new(),
            };
            (pipe, calls)
        }
    }

    impl Pipe for CountingPipe {
        fn name(&self) -> &str {
            &self.name
        }

        fn contracts(&self) -> Vec<Contract> {
            match &self.input {
                Some((container, kind)) => vec![Contract::new(
                    container,
                    kind.name(),
                    &self.output_container,
                    self.output_kind.name(),
                )],
                None => vec![Contract::source(&self.output_container, self.output_kind.name())],
            }
        }

        fn run(
            &self,
            _ctx: &PipeContext<'_>,
            request: &ContainerToTargetsMap,
            io: &mut StagedContainers<'_>,
        ) -> EngineResult<()> {
            let Some(targets) = request.targets(&self.output_container) else {
                return Ok(());
            };
            if targets.is_empty() {
                return Ok(());
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            for target in targets.clone() {
                let payload = match &self.input {
                    Some((container, kind)) => {
                        let source = requirement_target(&target, kind)?;
                        let input = io.get(container, &source)?.ok_or_else(|| {
                            EngineError::pipe(&self.name, format!("missing input '{source}'"))
                        })?;
                        input.clone()
                    }
                    None => Payload::Text(self.payload.clone()),
                };
                io.insert(&self.output_container, target, payload)?;
            }
            Ok(())
        }
    }

    /// A pipe that always fails, for atomicity tests.
    pub struct FailingPipe {
        output_container: String,
        output_kind: KindRef,
    }

    impl FailingPipe {
        pub fn new(output_container: impl Into<String>, output_kind: KindRef) -> Self {
            Self { output_container: output_container.into(), output_kind }
        }
    }

    impl Pipe for FailingPipe {
        fn name(&self) -> &str {
            "failing-pipe"
        }

        fn contracts(&self) -> Vec<Contract> {
            vec![Contract::source(&self.output_container, self.output_kind.name())]
        }

        fn run(
            &self,
            _ctx: &PipeContext<'_>,
            request: &ContainerToTargetsMap,
            _io: &mut StagedContainers<'_>,
        ) -> EngineResult<()> {
            if request.is_empty() {
                return Ok(());
            }
            Err(EngineError::pipe("failing-pipe", "external tool exited with status 1"))
        }
    }
}
