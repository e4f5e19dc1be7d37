//! Named artifact factories.
//!
//! Job definitions refer to readers, processors, writers and listeners by name.
//! The registry maps those names to factories and assembles a [`ChunkStep`]
//! for a step definition. Item types are checked when the step is assembled:
//! a processor registered as `I -> O` only pairs with a reader of `I` and a
//! writer of `O`; a step without a processor needs a reader and writer of the
//! same item type.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use batchforge_core::{DefinitionError, StepDefinition};

use crate::pipeline::{ItemProcessor, ItemReader, ItemWriter, StepContext, StepListener};
use crate::step::{ChunkStep, StepTask};

type ReaderFactory<T> = Arc<dyn Fn(&StepContext) -> Box<dyn ItemReader<T>> + Send + Sync>;
type ProcessorFactory<I, O> = Arc<dyn Fn(&StepContext) -> Box<dyn ItemProcessor<I, O>> + Send + Sync>;
type WriterFactory<T> = Arc<dyn Fn(&StepContext) -> Box<dyn ItemWriter<T>> + Send + Sync>;
type ListenerFactory = Arc<dyn Fn(&StepContext) -> Box<dyn StepListener> + Send + Sync>;

/// Builds a step around a processor (or a writer, for pass-through steps) once
/// the remaining artifacts are known.
type Assembler = Arc<dyn Fn(&ArtifactRegistry, &StepDefinition, &StepContext) -> Assembled + Send + Sync>;

type Assembled = Result<Box<dyn StepTask>, DefinitionError>;

struct Entry {
    factory: Arc<dyn Any + Send + Sync>,
    item_types: &'static str,
}

struct AssemblingEntry {
    entry: Entry,
    assemble: Assembler,
}

/// Registry of step artifacts by name.
#[derive(Default)]
pub struct ArtifactRegistry {
    readers: HashMap<String, Entry>,
    processors: HashMap<String, AssemblingEntry>,
    writers: HashMap<String, AssemblingEntry>,
    listeners: HashMap<String, ListenerFactory>,
}

impl core::fmt::Debug for ArtifactRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArtifactRegistry")
            .field("readers", &self.readers.keys().collect::<Vec<_>>())
            .field("processors", &self.processors.keys().collect::<Vec<_>>())
            .field("writers", &self.writers.keys().collect::<Vec<_>>())
            .field("listeners", &self.listeners.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn mismatch(name: &str, expected: &str, found: &str) -> DefinitionError {
    DefinitionError::UnknownArtifact(format!(
        "{name} (item type mismatch: step needs {expected}, artifact handles {found})"
    ))
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_reader<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: Send + 'static,
        F: Fn(&StepContext) -> Box<dyn ItemReader<T>> + Send + Sync + 'static,
    {
        let factory: ReaderFactory<T> = Arc::new(factory);
        self.readers.insert(
            name.into(),
            Entry {
                factory: Arc::new(factory),
                item_types: type_name::<T>(),
            },
        );
        self
    }

    pub fn register_processor<I, O, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(&StepContext) -> Box<dyn ItemProcessor<I, O>> + Send + Sync + 'static,
    {
        let factory: ProcessorFactory<I, O> = Arc::new(factory);
        let assemble: Assembler = Arc::new(
            |registry: &ArtifactRegistry, def: &StepDefinition, ctx: &StepContext| -> Assembled {
                let processor_name = def.artifacts.processor.as_deref().unwrap_or_default();
                let processor = registry
                    .processors
                    .get(processor_name)
                    .and_then(|e| e.entry.factory.downcast_ref::<ProcessorFactory<I, O>>())
                    .ok_or_else(|| DefinitionError::UnknownArtifact(processor_name.to_string()))?;
                let reader = registry.reader::<I>(&def.artifacts.reader)?;
                let writer = registry.writer::<O>(&def.artifacts.writer)?;
                let step = ChunkStep::new(reader(ctx), processor(ctx), writer(ctx));
                registry.finish(step, def, ctx)
            },
        );
        self.processors.insert(
            name.into(),
            AssemblingEntry {
                entry: Entry {
                    factory: Arc::new(factory),
                    item_types: type_name::<(I, O)>(),
                },
                assemble,
            },
        );
        self
    }

    pub fn register_writer<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: Send + 'static,
        F: Fn(&StepContext) -> Box<dyn ItemWriter<T>> + Send + Sync + 'static,
    {
        let factory: WriterFactory<T> = Arc::new(factory);
        let assemble: Assembler = Arc::new(
            |registry: &ArtifactRegistry, def: &StepDefinition, ctx: &StepContext| -> Assembled {
                let reader = registry.reader::<T>(&def.artifacts.reader)?;
                let writer = registry.writer::<T>(&def.artifacts.writer)?;
                let step = ChunkStep::pass_through(reader(ctx), writer(ctx));
                registry.finish(step, def, ctx)
            },
        );
        self.writers.insert(
            name.into(),
            AssemblingEntry {
                entry: Entry {
                    factory: Arc::new(factory),
                    item_types: type_name::<T>(),
                },
                assemble,
            },
        );
        self
    }

    pub fn register_listener<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&StepContext) -> Box<dyn StepListener> + Send + Sync + 'static,
    {
        self.listeners.insert(name.into(), Arc::new(factory));
        self
    }

    fn reader<T: Send + 'static>(&self, name: &str) -> Result<ReaderFactory<T>, DefinitionError> {
        let entry = self
            .readers
            .get(name)
            .ok_or_else(|| DefinitionError::UnknownArtifact(name.to_string()))?;
        entry
            .factory
            .downcast_ref::<ReaderFactory<T>>()
            .cloned()
            .ok_or_else(|| mismatch(name, type_name::<T>(), entry.item_types))
    }

    fn writer<T: Send + 'static>(&self, name: &str) -> Result<WriterFactory<T>, DefinitionError> {
        let entry = &self
            .writers
            .get(name)
            .ok_or_else(|| DefinitionError::UnknownArtifact(name.to_string()))?
            .entry;
        entry
            .factory
            .downcast_ref::<WriterFactory<T>>()
            .cloned()
            .ok_or_else(|| mismatch(name, type_name::<T>(), entry.item_types))
    }

    fn finish<I, O>(
        &self,
        step: ChunkStep<I, O>,
        def: &StepDefinition,
        ctx: &StepContext,
    ) -> Result<Box<dyn StepTask>, DefinitionError>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let step = match &def.artifacts.listener {
            None => step,
            Some(name) => {
                let listener = self
                    .listeners
                    .get(name)
                    .ok_or_else(|| DefinitionError::UnknownArtifact(name.clone()))?;
                step.with_listener(listener(ctx))
            }
        };
        Ok(Box::new(step))
    }

    /// Check that every artifact a step names is registered.
    pub fn check(&self, def: &StepDefinition) -> Result<(), DefinitionError> {
        let artifacts = &def.artifacts;
        if !self.readers.contains_key(&artifacts.reader) {
            return Err(DefinitionError::UnknownArtifact(artifacts.reader.clone()));
        }
        if !self.writers.contains_key(&artifacts.writer) {
            return Err(DefinitionError::UnknownArtifact(artifacts.writer.clone()));
        }
        if let Some(p) = &artifacts.processor {
            if !self.processors.contains_key(p) {
                return Err(DefinitionError::UnknownArtifact(p.clone()));
            }
        }
        if let Some(l) = &artifacts.listener {
            if !self.listeners.contains_key(l) {
                return Err(DefinitionError::UnknownArtifact(l.clone()));
            }
        }
        Ok(())
    }

    /// Assemble the step described by `def`.
    pub fn build_step(&self, def: &StepDefinition, ctx: &StepContext) -> Result<Box<dyn StepTask>, DefinitionError> {
        self.check(def)?;
        let assemble = match &def.artifacts.processor {
            Some(name) => self.processors.get(name).map(|e| e.assemble.clone()),
            None => self.writers.get(&def.artifacts.writer).map(|e| e.assemble.clone()),
        }
        .ok_or_else(|| DefinitionError::UnknownArtifact(def.artifacts.writer.clone()))?;
        assemble(self, def, ctx)
    }
}
