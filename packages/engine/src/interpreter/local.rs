// packages/engine/src/interpreter/local.rs
//! In-process embedded runtime
//!
//! Every [`LocalInterpreter`] owns a private heap:
//!
//! ```text
//! LocalInterpreter (ordinal N)
//! └─ Heap (Mutex)
//!    ├─ namespaces   module name → attributes (private copy)
//!    ├─ handles      handle → Value
//!    ├─ refs         handle → holders (materialized copies only)
//!    ├─ replicated   object id → handle (materialized copies)
//!    └─ archives     importer key → archive
//! ```
//!
//! A materialized copy is held by the `replicated` registry and by every
//! session that obtained it. Unloading drops the registry's hold only, so a
//! session already using the copy keeps it until the session ends.
//!
//! Nothing in a heap is reachable from another instance. The heap lock is
//! taken per operation, so sessions on the same instance interleave but
//! never run runtime code concurrently.

use crate::archive::{record_name, ArchiveReader};
use crate::interpreter::library::{CallArgs, Library, Namespaces, Scope, Value};
use crate::interpreter::{
    HostValue, InterpreterImpl, NativeResult, Obj, PickledObject, RuntimeLoader, SessionImpl,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

/// Loader producing in-process runtimes that share one [`Library`]
#[derive(Debug, Clone, Default)]
pub struct LocalRuntime {
    library: Library,
}

impl LocalRuntime {
    pub fn new(library: Library) -> Self {
        Self { library }
    }

    pub fn library(&self) -> &Library {
        &self.library
    }
}

impl RuntimeLoader for LocalRuntime {
    fn load(&self, ordinal: usize) -> NativeResult<Box<dyn InterpreterImpl>> {
        debug!("Loading in-process runtime for instance {}", ordinal);
        Ok(Box::new(LocalInterpreter::new(ordinal, self.library.clone())))
    }
}

/// Private state of one instance
struct Heap {
    namespaces: Namespaces,
    handles: HashMap<u64, Value>,
    next_handle: u64,
    refs: HashMap<u64, usize>,
    replicated: HashMap<u64, u64>,
    archives: HashMap<usize, Arc<dyn ArchiveReader>>,
    next_archive: usize,
}

impl Heap {
    fn new(namespaces: Namespaces) -> Self {
        Self {
            namespaces,
            handles: HashMap::new(),
            next_handle: 1,
            refs: HashMap::new(),
            replicated: HashMap::new(),
            archives: HashMap::new(),
            next_archive: 0,
        }
    }

    fn alloc(&mut self, value: Value) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, value);
        handle
    }

    fn retain(&mut self, handle: u64) {
        *self.refs.entry(handle).or_insert(0) += 1;
    }

    /// Drop one hold on `handle`, freeing it with the last one
    fn drop_ref(&mut self, handle: u64) {
        let Some(count) = self.refs.get_mut(&handle) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.refs.remove(&handle);
            self.handles.remove(&handle);
        }
    }

    fn value(&self, ordinal: usize, obj: Obj) -> NativeResult<&Value> {
        if obj.instance() != ordinal {
            return Err(format!(
                "handle belongs to instance {}, not instance {}",
                obj.instance(),
                ordinal
            )
            .into());
        }
        self.handles
            .get(&obj.handle())
            .ok_or_else(|| format!("invalid or released handle {}", obj.handle()).into())
    }

    fn values(&self, ordinal: usize, objs: &[Obj]) -> NativeResult<Vec<Value>> {
        objs.iter()
            .map(|obj| self.value(ordinal, *obj).cloned())
            .collect()
    }

    fn keywords(&self, ordinal: usize, kwargs: &[(String, Obj)]) -> NativeResult<BTreeMap<String, Value>> {
        kwargs
            .iter()
            .map(|(name, obj)| -> NativeResult<(String, Value)> {
                Ok((name.clone(), self.value(ordinal, *obj)?.clone()))
            })
            .collect()
    }

    fn archive(&self, index: usize) -> NativeResult<Arc<dyn ArchiveReader>> {
        self.archives
            .get(&index)
            .cloned()
            .ok_or_else(|| format!("package importer {index} has been released").into())
    }
}

/// One isolated in-process runtime
pub struct LocalInterpreter {
    ordinal: usize,
    library: Library,
    heap: Arc<Mutex<Heap>>,
}

impl LocalInterpreter {
    pub fn new(ordinal: usize, library: Library) -> Self {
        let heap = Heap::new(library.fresh_namespaces());
        Self {
            ordinal,
            library,
            heap: Arc::new(Mutex::new(heap)),
        }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Number of live handles, temporaries included
    pub fn live_handles(&self) -> usize {
        self.heap.lock().handles.len()
    }

    /// Number of importers not yet released
    pub fn live_importers(&self) -> usize {
        self.heap.lock().archives.len()
    }

    /// Whether `object_id` is materialized in this instance
    pub fn is_materialized(&self, object_id: u64) -> bool {
        self.heap.lock().replicated.contains_key(&object_id)
    }
}

impl InterpreterImpl for LocalInterpreter {
    fn acquire_session(&self) -> NativeResult<Box<dyn SessionImpl>> {
        Ok(Box::new(LocalSession {
            ordinal: self.ordinal,
            library: self.library.clone(),
            heap: Arc::clone(&self.heap),
            temporaries: Vec::new(),
            held: Vec::new(),
        }))
    }
}

/// Session on a [`LocalInterpreter`]; temporaries die with it
struct LocalSession {
    ordinal: usize,
    library: Library,
    heap: Arc<Mutex<Heap>>,
    temporaries: Vec<u64>,

    /// Materialized copies this session holds
    held: Vec<u64>,
}

impl LocalSession {
    fn temporary(&mut self, heap: &mut Heap, value: Value) -> Obj {
        let handle = heap.alloc(value);
        self.temporaries.push(handle);
        Obj::new(self.ordinal, handle)
    }

    fn invoke(
        &mut self,
        target: Obj,
        method: Option<&str>,
        args: &[Obj],
        kwargs: &[(String, Obj)],
    ) -> NativeResult<Obj> {
        let heap = Arc::clone(&self.heap);
        let mut heap = heap.lock();
        let target = heap.value(self.ordinal, target)?.clone();
        let call_args = CallArgs {
            receiver: None,
            positional: heap.values(self.ordinal, args)?,
            keyword: heap.keywords(self.ordinal, kwargs)?,
        };
        let result = dispatch(&self.library, self.ordinal, &mut heap, target, method, call_args)?;
        Ok(self.temporary(&mut heap, result))
    }
}

fn dispatch(
    library: &Library,
    ordinal: usize,
    heap: &mut Heap,
    target: Value,
    method: Option<&str>,
    mut args: CallArgs,
) -> NativeResult<Value> {
    let qualified = match (&target, method) {
        (Value::Function(name), None) => name.clone(),
        (Value::Object { class, .. }, None) => format!("{class}.__call__"),
        (Value::Object { class, .. }, Some(method)) => format!("{class}.{method}"),
        (Value::Module(module), Some(method)) => {
            match heap.namespaces.get(module).and_then(|attrs| attrs.get(method)) {
                Some(Value::Function(name)) => name.clone(),
                Some(other) => return Err(format!("'{module}.{method}' is a {}, not callable", other.kind()).into()),
                None => return Err(format!("module '{module}' has no attribute '{method}'").into()),
            }
        }
        (Value::Importer(index), Some(method)) => {
            let archive = heap.archive(*index)?;
            return importer_method(archive.as_ref(), method, &args);
        }
        (other, None) => return Err(format!("'{}' object is not callable", other.kind()).into()),
        (other, Some(method)) => {
            return Err(format!("'{}' object has no method '{method}'", other.kind()).into())
        }
    };

    if matches!(target, Value::Object { .. }) {
        args.receiver = Some(target);
    }

    let function = library
        .resolve(&qualified)
        .ok_or_else(|| format!("no native function named '{qualified}'"))?
        .clone();
    trace!("Instance {} calling {}", ordinal, qualified);
    let mut scope = Scope::new(ordinal, &mut heap.namespaces);
    function(&mut scope, args)
}

fn importer_method(archive: &dyn ArchiveReader, method: &str, args: &CallArgs) -> NativeResult<Value> {
    let name = record_name(args.str(0)?, args.str(1)?);
    let read = || {
        archive.read_record(&name).map_err(|e| {
            format!("failed to read '{name}' from package '{}': {e}", archive.name())
        })
    };

    match method {
        "load_pickle" => {
            let bytes = read()?;
            let value: Value = serde_json::from_slice(&bytes)?;
            value.check_picklable()?;
            Ok(value)
        }
        "load_text" => {
            let bytes = read()?;
            let text = String::from_utf8(bytes.to_vec())?;
            Ok(Value::Str(text))
        }
        other => Err(format!("package importer has no method '{other}'").into()),
    }
}

impl SessionImpl for LocalSession {
    fn global(&mut self, module: &str, name: &str) -> NativeResult<Obj> {
        let heap = Arc::clone(&self.heap);
        let mut heap = heap.lock();
        let attrs = heap
            .namespaces
            .get(module)
            .ok_or_else(|| format!("no module named '{module}'"))?;
        let value = attrs
            .get(name)
            .cloned()
            .ok_or_else(|| format!("module '{module}' has no attribute '{name}'"))?;
        Ok(self.temporary(&mut heap, value))
    }

    fn from_ivalue(&mut self, value: HostValue) -> NativeResult<Obj> {
        let heap = Arc::clone(&self.heap);
        let mut heap = heap.lock();
        Ok(self.temporary(&mut heap, Value::from_host(value)))
    }

    fn to_ivalue(&mut self, obj: Obj) -> NativeResult<HostValue> {
        self.heap.lock().value(self.ordinal, obj)?.to_host()
    }

    fn set_attr(&mut self, target: Obj, name: &str, value: Obj) -> NativeResult<()> {
        let mut heap = self.heap.lock();
        let value = heap.value(self.ordinal, value)?.clone();
        match heap.value(self.ordinal, target)?.clone() {
            Value::Module(module) => {
                let attrs = heap
                    .namespaces
                    .get_mut(&module)
                    .ok_or_else(|| format!("no module named '{module}'"))?;
                attrs.insert(name.to_string(), value);
                Ok(())
            }
            other => Err(format!("cannot set attribute '{name}' on {}", other.kind()).into()),
        }
    }

    fn call(&mut self, callee: Obj, args: &[Obj], kwargs: &[(String, Obj)]) -> NativeResult<Obj> {
        self.invoke(callee, None, args, kwargs)
    }

    fn call_method(
        &mut self,
        receiver: Obj,
        method: &str,
        args: &[Obj],
        kwargs: &[(String, Obj)],
    ) -> NativeResult<Obj> {
        self.invoke(receiver, Some(method), args, kwargs)
    }

    fn pickle(&mut self, obj: Obj) -> NativeResult<PickledObject> {
        let heap = self.heap.lock();
        let value = heap.value(self.ordinal, obj)?;
        value.check_picklable()?;
        Ok(PickledObject::new(serde_json::to_vec(value)?))
    }

    fn unpickle_or_get(&mut self, object_id: u64, pickled: &PickledObject) -> NativeResult<Obj> {
        let mut heap = self.heap.lock();
        let handle = match heap.replicated.get(&object_id) {
            Some(handle) => *handle,
            None => {
                let value: Value = serde_json::from_slice(pickled.payload())?;
                value.check_picklable()?;
                let handle = heap.alloc(value);
                heap.retain(handle);
                heap.replicated.insert(object_id, handle);
                debug!("Instance {} materialized object {}", self.ordinal, object_id);
                handle
            }
        };
        if !self.held.contains(&handle) {
            heap.retain(handle);
            self.held.push(handle);
        }
        Ok(Obj::new(self.ordinal, handle))
    }

    fn unload(&mut self, object_id: u64) -> NativeResult<()> {
        let mut heap = self.heap.lock();
        if let Some(handle) = heap.replicated.remove(&object_id) {
            heap.drop_ref(handle);
            debug!("Instance {} unloaded object {}", self.ordinal, object_id);
        }
        Ok(())
    }

    fn create_package_importer(&mut self, archive: Arc<dyn ArchiveReader>) -> NativeResult<Obj> {
        let mut heap = self.heap.lock();
        let key = heap.next_archive;
        heap.next_archive += 1;
        heap.archives.insert(key, archive);
        let handle = heap.alloc(Value::Importer(key));
        Ok(Obj::new(self.ordinal, handle))
    }

    fn release(&mut self, obj: Obj) -> NativeResult<()> {
        let mut heap = self.heap.lock();
        let value = heap.value(self.ordinal, obj)?.clone();
        if let Value::Importer(key) = value {
            heap.archives.remove(&key);
        }
        let registered = heap.replicated.len();
        heap.replicated.retain(|_, handle| *handle != obj.handle());
        if heap.replicated.len() < registered {
            heap.drop_ref(obj.handle());
        } else if !heap.refs.contains_key(&obj.handle()) {
            heap.handles.remove(&obj.handle());
        }
        Ok(())
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        let mut heap = self.heap.lock();
        for handle in self.temporaries.drain(..) {
            heap.handles.remove(&handle);
        }
        for handle in self.held.drain(..) {
            heap.drop_ref(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use crate::interpreter::library::{ModuleDef, VERSION_MODULE};

    fn library() -> Library {
        Library::new()
            .with_module(
                ModuleDef::new("demo")
                    .function("scaler", |_, args| {
                        Ok(Value::Object {
                            class: "demo.Scaler".to_string(),
                            state: Box::new(Value::Int(args.int(0)?)),
                        })
                    })
                    .function("boom", |_, _| panic!("native code exploded")),
            )
            .with_module(ModuleDef::new("demo.Scaler").function("__call__", |_, args| {
                let factor = args.receiver_state()?.as_int().unwrap_or(1);
                Ok(Value::Int(factor * args.int(0)?))
            }))
            .with_module(ModuleDef::new("counter").attr("count", Value::Int(0)).function(
                "bump",
                |scope, _| {
                    let next = scope.get_attr("counter", "count").and_then(Value::as_int).unwrap_or(0) + 1;
                    scope.set_attr("counter", "count", Value::Int(next))?;
                    Ok(Value::Int(next))
                },
            ))
    }

    #[test]
    fn test_global_and_call() {
        let interp = LocalInterpreter::new(0, library());
        let mut session = interp.acquire_session().unwrap();

        let scaler = session.global("demo", "scaler").unwrap();
        let three = session.from_ivalue(HostValue::Int(3)).unwrap();
        let obj = session.call(scaler, &[three], &[]).unwrap();
        let seven = session.from_ivalue(HostValue::Int(7)).unwrap();
        let result = session.call(obj, &[seven], &[]).unwrap();
        assert_eq!(session.to_ivalue(result).unwrap(), HostValue::Int(21));
    }

    #[test]
    fn test_missing_global() {
        let interp = LocalInterpreter::new(0, library());
        let mut session = interp.acquire_session().unwrap();
        let err = session.global("missing_mod", "missing_name").unwrap_err();
        assert_eq!(err.to_string(), "no module named 'missing_mod'");
    }

    #[test]
    fn test_temporaries_released_with_session() {
        let interp = LocalInterpreter::new(0, library());
        {
            let mut session = interp.acquire_session().unwrap();
            session.from_ivalue(HostValue::Int(1)).unwrap();
            session.global("demo", "scaler").unwrap();
            assert_eq!(interp.live_handles(), 2);
        }
        assert_eq!(interp.live_handles(), 0);
    }

    #[test]
    fn test_pickle_roundtrip_across_instances() {
        let a = LocalInterpreter::new(0, library());
        let b = LocalInterpreter::new(1, library());

        let mut sa = a.acquire_session().unwrap();
        let scaler = sa.global("demo", "scaler").unwrap();
        let five = sa.from_ivalue(HostValue::Int(5)).unwrap();
        let obj = sa.call(scaler, &[five], &[]).unwrap();
        let pickled = sa.pickle(obj).unwrap();

        let mut sb = b.acquire_session().unwrap();
        let copy = sb.unpickle_or_get(9, &pickled).unwrap();
        let again = sb.unpickle_or_get(9, &pickled).unwrap();
        assert_eq!(copy, again);
        assert!(b.is_materialized(9));
        assert!(!a.is_materialized(9));

        let two = sb.from_ivalue(HostValue::Int(2)).unwrap();
        let result = sb.call(copy, &[two], &[]).unwrap();
        assert_eq!(sb.to_ivalue(result).unwrap(), HostValue::Int(10));

        sb.unload(9).unwrap();
        assert!(!b.is_materialized(9));
    }

    #[test]
    fn test_modules_cannot_be_pickled() {
        let interp = LocalInterpreter::new(0, library());
        let mut session = interp.acquire_session().unwrap();
        let version = session.global("runtime", "version").unwrap();
        assert!(session.pickle(version).is_err());
    }

    #[test]
    fn test_namespaces_are_private() {
        let a = LocalInterpreter::new(0, library());
        let b = LocalInterpreter::new(1, library());

        let mut sa = a.acquire_session().unwrap();
        let module = sa.global("runtime", "version").unwrap();
        let tag = sa.from_ivalue(HostValue::Int(42)).unwrap();
        sa.set_attr(module, "interp", tag).unwrap();
        let interp_a = sa.global(VERSION_MODULE, "interp").unwrap();
        assert_eq!(sa.to_ivalue(interp_a).unwrap(), HostValue::Int(42));

        let mut sb = b.acquire_session().unwrap();
        let interp_b = sb.global(VERSION_MODULE, "interp").unwrap();
        assert_eq!(sb.to_ivalue(interp_b).unwrap(), HostValue::None);

        let counter = sa.global("counter", "count").unwrap();
        assert_eq!(sa.to_ivalue(counter).unwrap(), HostValue::Int(0));
        let bump_a = sa.global("counter", "bump").unwrap();
        sa.call(bump_a, &[], &[]).unwrap();
        let bump_b = sb.global("counter", "bump").unwrap();
        let first_b = sb.call(bump_b, &[], &[]).unwrap();
        assert_eq!(sb.to_ivalue(first_b).unwrap(), HostValue::Int(1));
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let a = LocalInterpreter::new(0, library());
        let b = LocalInterpreter::new(1, library());
        let mut sa = a.acquire_session().unwrap();
        let mut sb = b.acquire_session().unwrap();
        let obj = sa.from_ivalue(HostValue::Int(1)).unwrap();
        let err = sb.to_ivalue(obj).unwrap_err();
        assert!(err.to_string().contains("belongs to instance 0"));
    }

    #[test]
    fn test_importer_methods() {
        let pickled = serde_json::to_vec(&Value::Int(11)).unwrap();
        let archive = MemoryArchive::new("pkg")
            .with_record("models/linear/weights.pkl", pickled)
            .with_record("models/linear/README.txt", b"hello".to_vec());
        let interp = LocalInterpreter::new(0, library());
        let mut session = interp.acquire_session().unwrap();
        let importer = session.create_package_importer(Arc::new(archive)).unwrap();

        let module = session.from_ivalue("models.linear".into()).unwrap();
        let file = session.from_ivalue("README.txt".into()).unwrap();
        let text = session.call_method(importer, "load_text", &[module, file], &[]).unwrap();
        assert_eq!(session.to_ivalue(text).unwrap(), HostValue::Str("hello".into()));

        let missing = session.from_ivalue("nope.pkl".into()).unwrap();
        let err = session
            .call_method(importer, "load_pickle", &[module, missing], &[])
            .unwrap_err();
        assert!(err.to_string().contains("models/linear/nope.pkl"));

        session.release(importer).unwrap();
        assert!(session.call_method(importer, "load_text", &[module, file], &[]).is_err());
    }

    #[test]
    fn test_unload_keeps_copy_for_holding_session() {
        let interp = LocalInterpreter::new(0, library());
        let pickled = PickledObject::new(
            serde_json::to_vec(&Value::Object {
                class: "demo.Scaler".to_string(),
                state: Box::new(Value::Int(3)),
            })
            .unwrap(),
        );

        let mut holder = interp.acquire_session().unwrap();
        let copy = holder.unpickle_or_get(4, &pickled).unwrap();

        let mut other = interp.acquire_session().unwrap();
        other.unload(4).unwrap();
        assert!(!interp.is_materialized(4));

        let two = holder.from_ivalue(HostValue::Int(2)).unwrap();
        let result = holder.call(copy, &[two], &[]).unwrap();
        assert_eq!(holder.to_ivalue(result).unwrap(), HostValue::Int(6));

        drop(holder);
        drop(other);
        assert_eq!(interp.live_handles(), 0);
    }

    #[test]
    fn test_copy_shared_within_session_counts_once() {
        let interp = LocalInterpreter::new(0, library());
        let pickled = PickledObject::new(serde_json::to_vec(&Value::Int(1)).unwrap());
        {
            let mut session = interp.acquire_session().unwrap();
            let first = session.unpickle_or_get(1, &pickled).unwrap();
            let again = session.unpickle_or_get(1, &pickled).unwrap();
            assert_eq!(first, again);
        }
        assert!(interp.is_materialized(1));
        assert_eq!(interp.live_handles(), 1);

        interp.acquire_session().unwrap().unload(1).unwrap();
        assert_eq!(interp.live_handles(), 0);
    }

    #[test]
    fn test_released_importers_do_not_accumulate() {
        let interp = LocalInterpreter::new(0, library());
        let mut session = interp.acquire_session().unwrap();
        for _ in 0..5 {
            let archive = Arc::new(MemoryArchive::new("pkg"));
            let importer = session.create_package_importer(archive).unwrap();
            assert_eq!(interp.live_importers(), 1);
            session.release(importer).unwrap();
        }
        assert_eq!(interp.live_importers(), 0);
        assert_eq!(interp.live_handles(), 0);
    }
}
