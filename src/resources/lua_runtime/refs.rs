//! Strong and weak handles to Lua values held by native code.
//!
//! A [`ScriptRef`] pins a value into the VM's ref table so the collector
//! keeps it alive; a [`WeakScriptRef`] records it in the weak table
//! (`__mode = "v"`) and reads back as nil once the value is collected.
//!
//! Handles are dropped from native code that has no `&Lua` at hand, so a drop
//! only queues the slot. [`RefSlots::flush`] clears queued slots the next time
//! the VM is touched, and only then returns them to the free list, so a new
//! handle can never land on a slot that still holds an old value.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::error;
use mlua::prelude::*;
use smallvec::SmallVec;

use super::marshal::{FromScript, IntoScript, Nil};
use super::runtime::bridge_state;

const REF_TABLE: &str = "aberred.refs";
const WEAK_TABLE: &str = "aberred.weakrefs";

/// Identity of one VM instance, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmId(u64);

impl VmId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        VmId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Strong,
    Weak,
}

#[derive(Default)]
struct SlotPool {
    next: i64,
    free: Vec<i64>,
    live: usize,
}

impl SlotPool {
    fn take(&mut self) -> i64 {
        self.live += 1;
        self.free.pop().unwrap_or_else(|| {
            self.next += 1;
            self.next
        })
    }

    fn give_back(&mut self, slot: i64) {
        self.live -= 1;
        self.free.push(slot);
    }
}

/// Slot bookkeeping for the ref and weak tables of one VM.
pub struct RefSlots {
    vm: VmId,
    strong: RefCell<SlotPool>,
    weak: RefCell<SlotPool>,
    released: RefCell<SmallVec<[(SlotKind, i64); 8]>>,
    flushing: Cell<bool>,
}

impl RefSlots {
    /// Creates both tables in the registry. Called once at VM start.
    pub(crate) fn install(lua: &Lua, vm: VmId) -> LuaResult<Rc<Self>> {
        lua.set_named_registry_value(REF_TABLE, lua.create_table()?)?;
        let weak: LuaTable = lua
            .load("return setmetatable({}, { __mode = 'v' })")
            .set_name("=weakrefs")
            .eval()?;
        lua.set_named_registry_value(WEAK_TABLE, weak)?;
        Ok(Rc::new(Self {
            vm,
            strong: RefCell::new(SlotPool::default()),
            weak: RefCell::new(SlotPool::default()),
            released: RefCell::new(SmallVec::new()),
            flushing: Cell::new(false),
        }))
    }

    pub fn vm_id(&self) -> VmId {
        self.vm
    }

    fn table(lua: &Lua, kind: SlotKind) -> LuaResult<LuaTable> {
        match kind {
            SlotKind::Strong => lua.named_registry_value(REF_TABLE),
            SlotKind::Weak => lua.named_registry_value(WEAK_TABLE),
        }
    }

    fn pool(&self, kind: SlotKind) -> &RefCell<SlotPool> {
        match kind {
            SlotKind::Strong => &self.strong,
            SlotKind::Weak => &self.weak,
        }
    }

    fn acquire(&self, lua: &Lua, kind: SlotKind, value: LuaValue) -> LuaResult<i64> {
        self.flush(lua)?;
        let slot = self.pool(kind).borrow_mut().take();
        Self::table(lua, kind)?.raw_set(slot, value)?;
        Ok(slot)
    }

    fn release(&self, kind: SlotKind, slot: i64) {
        match self.released.try_borrow_mut() {
            Ok(mut queue) => queue.push((kind, slot)),
            Err(_) => error!("Reference slot {} released during flush, leaked", slot),
        }
    }

    /// Clears every slot released since the last flush.
    pub fn flush(&self, lua: &Lua) -> LuaResult<()> {
        if self.flushing.replace(true) {
            return Ok(());
        }
        let pending = std::mem::take(&mut *self.released.borrow_mut());
        let mut result = Ok(());
        for (kind, slot) in pending {
            if let Err(e) = Self::table(lua, kind).and_then(|t| t.raw_set(slot, LuaValue::Nil)) {
                result = Err(e);
                continue;
            }
            self.pool(kind).borrow_mut().give_back(slot);
        }
        self.flushing.set(false);
        result
    }

    /// Releases waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.released.borrow().len()
    }

    /// Strong slots currently in use (including released but unflushed ones).
    pub fn live_strong(&self) -> usize {
        self.strong.borrow().live
    }

    /// Weak slots currently in use (including released but unflushed ones).
    pub fn live_weak(&self) -> usize {
        self.weak.borrow().live
    }
}

struct Pinned {
    slot: i64,
    kind: SlotKind,
    slots: Rc<RefSlots>,
}

impl Drop for Pinned {
    fn drop(&mut self) {
        self.slots.release(self.kind, self.slot);
    }
}

fn pin(lua: &Lua, kind: SlotKind, value: LuaValue) -> LuaResult<Option<Rc<Pinned>>> {
    if value.is_nil() {
        return Ok(None);
    }
    let slots = bridge_state(lua)?.slots.clone();
    let slot = slots.acquire(lua, kind, value)?;
    Ok(Some(Rc::new(Pinned { slot, kind, slots })))
}

fn fetch(lua: &Lua, pinned: &Pinned) -> LuaResult<LuaValue> {
    let current = bridge_state(lua)?.vm;
    if pinned.slots.vm_id() != current {
        error!(
            "Attempt to push a reference owned by {} into {}",
            pinned.slots.vm_id(),
            current
        );
        return Ok(LuaValue::Nil);
    }
    RefSlots::table(lua, pinned.kind)?.raw_get(pinned.slot)
}

/// Strong handle to a Lua value.
///
/// Clones share the same slot; the slot is released when the last clone goes
/// away.
#[derive(Clone, Default)]
pub struct ScriptRef {
    inner: Option<Rc<Pinned>>,
}

impl ScriptRef {
    /// Empty handle, equivalent to `nil`.
    pub fn nil() -> Self {
        Self::default()
    }

    /// Pins `value`. Pinning `nil` gives an empty handle.
    pub fn new(lua: &Lua, value: LuaValue) -> LuaResult<Self> {
        Ok(Self {
            inner: pin(lua, SlotKind::Strong, value)?,
        })
    }

    /// Pins any marshallable value.
    pub fn from_value<T: IntoScript>(lua: &Lua, value: T) -> LuaResult<Self> {
        Self::new(lua, value.into_script(lua)?)
    }

    /// The pinned value, or `nil` for an empty handle.
    pub fn get(&self, lua: &Lua) -> LuaResult<LuaValue> {
        match &self.inner {
            Some(pinned) => fetch(lua, pinned),
            None => Ok(LuaValue::Nil),
        }
    }

    /// Drops this handle's share of the slot. Releasing twice is a no-op.
    pub fn release(&mut self) {
        self.inner = None;
    }

    pub fn is_nil(&self) -> bool {
        self.inner.is_none()
    }

    pub fn slot(&self) -> Option<i64> {
        self.inner.as_ref().map(|p| p.slot)
    }

    pub fn vm_id(&self) -> Option<VmId> {
        self.inner.as_ref().map(|p| p.slots.vm_id())
    }

    /// True when both handles share one slot.
    pub fn same_slot(&self, other: &ScriptRef) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl PartialEq<Nil> for ScriptRef {
    fn eq(&self, _: &Nil) -> bool {
        self.is_nil()
    }
}

impl fmt::Debug for ScriptRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(p) => write!(f, "ScriptRef({}:{})", p.slots.vm_id(), p.slot),
            None => write!(f, "ScriptRef(nil)"),
        }
    }
}

impl IntoScript for ScriptRef {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        self.get(lua)
    }
}

impl IntoScript for &ScriptRef {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        self.get(lua)
    }
}

impl FromScript for ScriptRef {
    fn get(lua: &Lua, value: LuaValue) -> Option<Self> {
        Some(ScriptRef::new(lua, value).unwrap_or_else(|e| {
            error!("Failed to pin value: {}", e);
            ScriptRef::nil()
        }))
    }
}

/// Weak handle to a Lua value. Never keeps the value alive.
#[derive(Clone, Default)]
pub struct WeakScriptRef {
    inner: Option<Rc<Pinned>>,
}

impl WeakScriptRef {
    pub fn nil() -> Self {
        Self::default()
    }

    pub fn new(lua: &Lua, value: LuaValue) -> LuaResult<Self> {
        Ok(Self {
            inner: pin(lua, SlotKind::Weak, value)?,
        })
    }

    /// The value if it is still alive, `nil` once it has been collected.
    pub fn get(&self, lua: &Lua) -> LuaResult<LuaValue> {
        match &self.inner {
            Some(pinned) => fetch(lua, pinned),
            None => Ok(LuaValue::Nil),
        }
    }

    /// Upgrades to a strong handle if the value is still alive.
    pub fn upgrade(&self, lua: &Lua) -> LuaResult<ScriptRef> {
        ScriptRef::new(lua, self.get(lua)?)
    }

    pub fn release(&mut self) {
        self.inner = None;
    }

    pub fn is_nil(&self) -> bool {
        self.inner.is_none()
    }

    pub fn slot(&self) -> Option<i64> {
        self.inner.as_ref().map(|p| p.slot)
    }

    pub fn vm_id(&self) -> Option<VmId> {
        self.inner.as_ref().map(|p| p.slots.vm_id())
    }
}

impl PartialEq<Nil> for WeakScriptRef {
    fn eq(&self, _: &Nil) -> bool {
        self.is_nil()
    }
}

impl fmt::Debug for WeakScriptRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(p) => write!(f, "WeakScriptRef({}:{})", p.slots.vm_id(), p.slot),
            None => write!(f, "WeakScriptRef(nil)"),
        }
    }
}

impl IntoScript for &WeakScriptRef {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        self.get(lua)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::lua_runtime::ScriptVm;

    #[test]
    fn strong_ref_keeps_value_alive() {
        let vm = ScriptVm::new().unwrap();
        let lua = vm.lua();
        let table: LuaTable = lua.load("return { answer = 42 }").eval().unwrap();
        let r = ScriptRef::new(lua, LuaValue::Table(table)).unwrap();
        lua.load("collectgarbage('collect')").exec().unwrap();

        let LuaValue::Table(back) = r.get(lua).unwrap() else {
            panic!("expected table")
        };
        assert_eq!(back.get::<i32>("answer").unwrap(), 42);
        assert_eq!(r.vm_id(), Some(vm.id()));
        assert!(r.slot().is_some());
    }

    #[test]
    fn nil_handles_compare_with_nil() {
        let vm = ScriptVm::new().unwrap();
        let r = ScriptRef::new(vm.lua(), LuaValue::Nil).unwrap();
        assert!(r.is_nil());
        assert_eq!(r, Nil);
        assert_eq!(r.slot(), None);
        assert_eq!(ScriptRef::nil().get(vm.lua()).unwrap(), LuaValue::Nil);
    }

    #[test]
    fn release_is_idempotent_and_slot_reused_after_flush() {
        let vm = ScriptVm::new().unwrap();
        let lua = vm.lua();
        let base = vm.slots().live_strong();

        let mut r = ScriptRef::from_value(lua, "first").unwrap();
        let copy = r.clone();
        let slot = r.slot();
        r.release();
        r.release();
        assert!(r.is_nil());
        assert_eq!(vm.slots().pending(), 0, "copy still holds the slot");

        drop(copy);
        assert_eq!(vm.slots().pending(), 1);

        let next = ScriptRef::from_value(lua, "second").unwrap();
        assert_eq!(vm.slots().pending(), 0);
        assert_eq!(next.slot(), slot);
        assert_eq!(String::get(lua, next.get(lua).unwrap()).as_deref(), Some("second"));
        assert_eq!(vm.slots().live_strong(), base + 1);
    }

    #[test]
    fn weak_ref_goes_nil_after_collection() {
        let vm = ScriptVm::new().unwrap();
        let lua = vm.lua();
        let weak = {
            let table = lua.create_table().unwrap();
            WeakScriptRef::new(lua, LuaValue::Table(table)).unwrap()
        };
        assert!(!weak.is_nil());
        lua.load("collectgarbage('collect')").exec().unwrap();
        assert_eq!(weak.get(lua).unwrap(), LuaValue::Nil);
    }

    #[test]
    fn weak_ref_follows_live_value() {
        let vm = ScriptVm::new().unwrap();
        let lua = vm.lua();
        lua.load("keep = {}").exec().unwrap();
        let keep: LuaValue = lua.globals().get("keep").unwrap();
        let weak = WeakScriptRef::new(lua, keep).unwrap();
        lua.load("collectgarbage('collect')").exec().unwrap();
        let strong = weak.upgrade(lua).unwrap();
        assert!(!strong.is_nil());
        let same: bool = lua
            .load("return ... == keep")
            .call(strong.get(lua).unwrap())
            .unwrap();
        assert!(same);
    }

    #[test]
    fn refs_do_not_cross_vms() {
        let a = ScriptVm::new().unwrap();
        let b = ScriptVm::new().unwrap();
        let r = ScriptRef::from_value(a.lua(), 5).unwrap();
        assert_eq!(r.get(b.lua()).unwrap(), LuaValue::Nil);
        assert_ne!(a.id(), b.id());
    }
}
