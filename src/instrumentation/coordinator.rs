//! Decides which methods get instrumented and assembles the agent's answer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use super::{Instrumentor, MethodRegistry};
use crate::classfile::ClassFile;
use crate::types::{InstrumentationType, LoadedClass, MethodSignature, RootSelector};
use crate::wire::{ClassReplacement, Command, InstrumentMethodGroup, InstrumentationResult};

/// Builds instrumentation responses for class-load events of one profiling session.
pub struct InstrumentationCoordinator {
    instrumentor: Arc<dyn Instrumentor>,
    registry: Arc<MethodRegistry>,
    instr_type: InstrumentationType,
    root_selectors: Vec<RootSelector>,
    /// Original bytes of every class that was replaced, keyed by `(name, loader id)`
    originals: BTreeMap<(String, i32), Bytes>,
    class_ids: HashMap<(String, i32), i32>,
}

impl InstrumentationCoordinator {
    pub fn new(instrumentor: Arc<dyn Instrumentor>, registry: Arc<MethodRegistry>) -> Self {
        Self {
            instrumentor,
            registry,
            instr_type: InstrumentationType::RecursiveFull,
            root_selectors: Vec::new(),
            originals: BTreeMap::new(),
            class_ids: HashMap::new(),
        }
    }

    pub fn with_instrumentation_type(mut self, instr_type: InstrumentationType) -> Self {
        self.instr_type = instr_type;
        self
    }

    pub fn instrumentation_type(&self) -> InstrumentationType {
        self.instr_type
    }

    pub fn root_selectors(&self) -> &[RootSelector] {
        &self.root_selectors
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    /// Answers the first class-load batch.
    ///
    /// Every class gets an entry in the result, in presentation order. A class whose
    /// rewrite fails is recorded as an error and left untouched; the batch continues.
    pub fn build_initial_response(
        &mut self,
        root_selectors: &[RootSelector],
        classes: &[LoadedClass],
    ) -> InstrumentationResult {
        self.root_selectors = root_selectors.to_vec();

        let mut result = InstrumentationResult::with_capacity(classes.len());
        for class in classes {
            self.instrument_class(class, &mut result);
        }

        info!(
            "Root batch: {} classes, {} replaced, {} methods instrumented, {} failures",
            classes.len(),
            result.replaced_count(),
            result.instrumented_methods().count(),
            result.errors().len()
        );
        result
    }

    /// Answers a class loaded after the root batch, using the stored root selectors.
    pub fn build_follow_up_response(&mut self, class: &LoadedClass) -> InstrumentationResult {
        let mut result = InstrumentationResult::with_capacity(1);
        self.instrument_class(class, &mut result);
        if result.replaced_count() > 0 {
            debug!(
                "Instrumented late class {} ({} methods)",
                class.name,
                result.instrumented_methods().count()
            );
        }
        result
    }

    fn instrument_class(&mut self, class: &LoadedClass, result: &mut InstrumentationResult) {
        if !self.instr_type.instruments_methods()
            || !self.root_selectors.iter().any(|s| s.matches_class(&class.name))
        {
            result.push_untouched(&class.name);
            return;
        }

        if class.bytes.is_empty() {
            trace!("No class file cached for {}, leaving it untouched", class.name);
            result.push_untouched(&class.name);
            return;
        }

        let parsed = match ClassFile::parse(&class.bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Skipping malformed class file {}: {}", class.name, e);
                result.record_error(&class.name, format!("malformed class file: {e}"));
                result.push_untouched(&class.name);
                return;
            }
        };

        let candidates: Vec<MethodSignature> = parsed
            .methods
            .iter()
            .filter(|m| m.has_code())
            .filter(|m| {
                self.root_selectors.iter().any(|s| s.matches(&class.name, &m.name, &m.descriptor))
            })
            .map(|m| MethodSignature::new(&class.name, &m.name, &m.descriptor))
            .collect();

        if candidates.is_empty() {
            result.push_untouched(&class.name);
            return;
        }

        match self.instrumentor.instrument(&class.name, &class.bytes, &self.root_selectors) {
            Ok(Some(replacement)) => {
                let ids = candidates.into_iter().map(|m| self.registry.register(m)).collect();
                self.originals
                    .entry((class.name.clone(), class.loader_id))
                    .or_insert_with(|| class.bytes.clone());
                result.push_class(&class.name, ids, Some(Bytes::from(replacement)));
            }
            Ok(None) => {
                trace!("Instrumentor left {} unchanged", class.name);
                result.push_untouched(&class.name);
            }
            Err(e) => {
                warn!("Instrumentation of {} failed: {}", class.name, e);
                result.record_error(&class.name, e.message());
                result.push_untouched(&class.name);
            }
        }
    }

    /// Builds the command that puts back the original bytes of every replaced class,
    /// then forgets them.
    pub fn clear_all_instrumentation_command(&mut self) -> Command {
        let classes: Vec<ClassReplacement> = std::mem::take(&mut self.originals)
            .into_iter()
            .map(|((class_name, loader_id), bytes)| ClassReplacement::new(class_name, loader_id, bytes))
            .collect();
        info!("Restoring {} instrumented classes", classes.len());
        Command::InstrumentMethodGroup(InstrumentMethodGroup {
            instr_type: InstrumentationType::None,
            classes,
        })
    }

    pub fn instrumented_class_count(&self) -> usize {
        self.originals.len()
    }

    /// Stable id for a `(class, loader)` pair, assigned on first request.
    pub fn class_id(&mut self, class_name: &str, loader_id: i32) -> i32 {
        let next = self.class_ids.len() as i32 + 1;
        *self.class_ids.entry((class_name.to_string(), loader_id)).or_insert(next)
    }

    /// Forgets all per-session state. Registered method ids are kept.
    pub fn reset(&mut self) {
        self.root_selectors.clear();
        self.originals.clear();
        self.class_ids.clear();
    }
}

impl std::fmt::Debug for InstrumentationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentationCoordinator")
            .field("instr_type", &self.instr_type)
            .field("root_selectors", &self.root_selectors)
            .field("instrumented_classes", &self.originals.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ClassFileBuilder, INSTRUMENTED_MARKER, ScriptedInstrumentor};

    fn class(name: &str, methods: &[(&str, &str)]) -> LoadedClass {
        let internal = name.replace('.', "/");
        let mut builder = ClassFileBuilder::new(&internal);
        for (method, descriptor) in methods {
            builder = builder.method(method, descriptor);
        }
        LoadedClass::new(name, 1, 0, builder.build())
    }

    fn coordinator(instrumentor: ScriptedInstrumentor) -> (InstrumentationCoordinator, Arc<ScriptedInstrumentor>) {
        let instrumentor = Arc::new(instrumentor);
        let coordinator = InstrumentationCoordinator::new(
            Arc::clone(&instrumentor) as Arc<dyn Instrumentor>,
            Arc::new(MethodRegistry::new()),
        );
        (coordinator, instrumentor)
    }

    #[test]
    fn failure_in_one_class_does_not_stop_the_batch() {
        let (mut coordinator, _) =
            coordinator(ScriptedInstrumentor::new().failing_for("com.app.Second"));
        let classes = [
            class("com.app.First", &[("run", "()V")]),
            class("com.app.Second", &[("run", "()V")]),
            class("com.app.Third", &[("run", "()V"), ("stop", "()V")]),
        ];

        let result = coordinator
            .build_initial_response(&[RootSelector::class_prefix("com.app.*")], &classes);

        assert_eq!(result.class_names(), &["com.app.First", "com.app.Second", "com.app.Third"]);
        assert_eq!(result.method_ids().len(), 3);
        assert_eq!(result.replacement_bytes().len(), 3);

        assert_eq!(result.method_ids()[0], vec![1]);
        assert!(result.method_ids()[1].is_empty());
        assert!(result.replacement_bytes()[1].is_none());
        assert_eq!(result.method_ids()[2], vec![2, 3]);
        assert!(result.replacement_bytes()[2].as_ref().unwrap().ends_with(INSTRUMENTED_MARKER));

        assert_eq!(result.errors().len(), 1);
        assert_eq!(result.errors()[0].class_name, "com.app.Second");
        let methods: Vec<_> = result.instrumented_methods().collect();
        assert_eq!(methods, vec![("com.app.First", 1), ("com.app.Third", 2), ("com.app.Third", 3)]);
    }

    #[test]
    fn empty_batch_gives_empty_result() {
        let (mut coordinator, instrumentor) = coordinator(ScriptedInstrumentor::new());
        let result = coordinator.build_initial_response(&[RootSelector::class_prefix("a.")], &[]);
        assert!(result.is_empty());
        assert!(!result.has_errors());
        assert!(instrumentor.calls().is_empty());
    }

    #[test]
    fn unselected_classes_are_not_sent_to_the_instrumentor() {
        let (mut coordinator, instrumentor) = coordinator(ScriptedInstrumentor::new());
        let classes = [
            class("java.lang.String", &[("length", "()I")]),
            class("com.app.Main", &[("main", "([Ljava/lang/String;)V")]),
        ];
        let result = coordinator
            .build_initial_response(&[RootSelector::class_prefix("com.app.**")], &classes);

        assert_eq!(instrumentor.calls(), vec!["com.app.Main".to_string()]);
        assert!(result.replacement_bytes()[0].is_none());
        assert!(result.replacement_bytes()[1].is_some());
    }

    #[test]
    fn method_selectors_pick_matching_methods_and_overloads() {
        let (mut coordinator, _) = coordinator(ScriptedInstrumentor::new());
        let classes = [class(
            "com.app.Service",
            &[("handle", "()V"), ("handle", "(I)V"), ("close", "()V")],
        )];
        let selectors = [RootSelector::new("com.app.Service", "handle", "")];

        let result = coordinator.build_initial_response(&selectors, &classes);
        assert_eq!(result.method_ids()[0].len(), 2);
        for &id in &result.method_ids()[0] {
            assert_eq!(coordinator.registry().get(id).unwrap().method_name, "handle");
        }
    }

    #[test]
    fn malformed_class_file_is_a_per_class_error() {
        let (mut coordinator, instrumentor) = coordinator(ScriptedInstrumentor::new());
        let classes = [
            LoadedClass::new("com.app.Broken", 1, 0, vec![0xCA, 0xFE]),
            class("com.app.Fine", &[("run", "()V")]),
        ];
        let result =
            coordinator.build_initial_response(&[RootSelector::class_prefix("com.app.")], &classes);

        assert_eq!(result.len(), 2);
        assert!(result.error_message().unwrap().starts_with("com.app.Broken: malformed class file"));
        assert_eq!(instrumentor.calls(), vec!["com.app.Fine".to_string()]);
    }

    #[test]
    fn follow_up_uses_the_root_selectors() {
        let (mut coordinator, _) = coordinator(ScriptedInstrumentor::new());
        coordinator.build_initial_response(&[RootSelector::class_prefix("com.app.")], &[]);

        let late = coordinator.build_follow_up_response(&class("com.app.Late", &[("go", "()V")]));
        assert_eq!(late.replaced_count(), 1);
        let other = coordinator.build_follow_up_response(&class("org.lib.Other", &[("go", "()V")]));
        assert_eq!(other.replaced_count(), 0);
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn clear_all_restores_original_bytes_once() {
        let (mut coordinator, _) = coordinator(ScriptedInstrumentor::new());
        let original = class("com.app.Main", &[("run", "()V")]);
        coordinator.build_initial_response(
            &[RootSelector::class_prefix("com.app.")],
            std::slice::from_ref(&original),
        );
        assert_eq!(coordinator.instrumented_class_count(), 1);

        let Command::InstrumentMethodGroup(group) = coordinator.clear_all_instrumentation_command()
        else {
            panic!("expected an instrument method group command");
        };
        assert_eq!(group.instr_type, InstrumentationType::None);
        assert_eq!(group.classes, vec![ClassReplacement::new("com.app.Main", 1, original.bytes)]);

        let Command::InstrumentMethodGroup(again) = coordinator.clear_all_instrumentation_command()
        else {
            panic!("expected an instrument method group command");
        };
        assert!(again.classes.is_empty());
    }

    #[test]
    fn class_ids_are_stable_per_loader() {
        let (mut coordinator, _) = coordinator(ScriptedInstrumentor::new());
        let a = coordinator.class_id("a.A", 1);
        let b = coordinator.class_id("a.A", 2);
        assert_ne!(a, b);
        assert_eq!(coordinator.class_id("a.A", 1), a);
    }

    #[test]
    fn monitoring_mode_never_instruments() {
        let (coordinator, instrumentor) = coordinator(ScriptedInstrumentor::new());
        let mut coordinator = coordinator.with_instrumentation_type(InstrumentationType::None);
        let result = coordinator.build_initial_response(
            &[RootSelector::class_prefix("com.app.")],
            &[class("com.app.Main", &[("run", "()V")])],
        );
        assert_eq!(result.replaced_count(), 0);
        assert!(instrumentor.calls().is_empty());
    }
}
