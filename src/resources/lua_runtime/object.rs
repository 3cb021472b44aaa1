//! Native objects that can be handed to scripts.
//!
//! A native type becomes script-visible by implementing [`ScriptClass`]. The
//! object itself is shared through `Rc`; the script wrapper (a userdata, see
//! [`class`](super::class)) holds exactly one of those `Rc`s. The object keeps
//! a weak [`BackRef`] to its wrapper so pushing it again reuses the wrapper
//! instead of creating a second one.
//!
//! ```ignore
//! struct Sprite {
//!     back_ref: BackRef,
//!     frame: Cell<i32>,
//! }
//!
//! impl Exposed for Sprite {
//!     fn back_ref(&self) -> &BackRef {
//!         &self.back_ref
//!     }
//! }
//!
//! impl ScriptClass for Sprite {
//!     const TYPE_NAME: &'static str = "Sprite";
//! }
//! ```
//!
//! Derived classes embed their base and name it:
//!
//! ```ignore
//! struct AnimatedSprite {
//!     base: Rc<Sprite>,
//!     back_ref: BackRef,
//! }
//!
//! impl Exposed for AnimatedSprite {
//!     fn back_ref(&self) -> &BackRef {
//!         &self.back_ref
//!     }
//!
//!     fn base_object(self: Rc<Self>) -> Option<Rc<dyn Exposed>> {
//!         Some(self.base.clone())
//!     }
//! }
//!
//! impl ScriptClass for AnimatedSprite {
//!     const TYPE_NAME: &'static str = "AnimatedSprite";
//!     const BASE_TYPE_NAME: Option<&'static str> = Some("Sprite");
//! }
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use mlua::prelude::*;

use super::refs::WeakScriptRef;

/// Turns an `Rc` of a concrete type into `Rc<dyn Any>` for downcasting.
pub trait AsAnyRc: Any {
    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any>;
}

impl<T: Any> AsAnyRc for T {
    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Object-safe half of [`ScriptClass`], used behind `Rc<dyn Exposed>`.
pub trait Exposed: AsAnyRc {
    /// Slot remembering the object's script wrapper.
    fn back_ref(&self) -> &BackRef;

    /// The embedded base-class object, for classes with a base.
    fn base_object(self: Rc<Self>) -> Option<Rc<dyn Exposed>> {
        None
    }
}

/// A native type registered as a script class.
pub trait ScriptClass: Exposed + Sized + 'static {
    /// Name of the class table, unique per VM.
    const TYPE_NAME: &'static str;

    /// Name of the base class, which must be registered first.
    const BASE_TYPE_NAME: Option<&'static str> = None;
}

/// Converts a type-erased object back to its concrete type.
pub(crate) fn downcast_rc<T: ScriptClass>(object: Rc<dyn Exposed>) -> Option<Rc<T>> {
    <dyn Exposed as AsAnyRc>::as_any_rc(object).downcast::<T>().ok()
}

/// Weak link from a native object to its script wrapper.
#[derive(Default)]
pub struct BackRef {
    wrapper: RefCell<Option<WeakScriptRef>>,
}

impl BackRef {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live wrapper, if there is one.
    pub(crate) fn wrapper(&self, lua: &Lua) -> LuaResult<Option<LuaAnyUserData>> {
        let weak = match &*self.wrapper.borrow() {
            Some(weak) => weak.clone(),
            None => return Ok(None),
        };
        match weak.get(lua)? {
            LuaValue::UserData(ud) => Ok(Some(ud)),
            _ => Ok(None),
        }
    }

    pub(crate) fn set(&self, weak: WeakScriptRef) {
        *self.wrapper.borrow_mut() = Some(weak);
    }

    /// Forgets the wrapper only if it is still the one stored in `slot`.
    /// A newer wrapper created after the old one became unreachable keeps
    /// its link.
    pub(crate) fn clear_slot(&self, slot: i64) {
        let mut wrapper = self.wrapper.borrow_mut();
        if wrapper.as_ref().and_then(WeakScriptRef::slot) == Some(slot) {
            *wrapper = None;
        }
    }

    pub(crate) fn clear(&self) {
        *self.wrapper.borrow_mut() = None;
    }

    /// True while a wrapper has been recorded and not cleared. The wrapper may
    /// already be unreachable.
    pub fn is_linked(&self) -> bool {
        self.wrapper.borrow().is_some()
    }
}

impl fmt::Debug for BackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BackRef").field(&*self.wrapper.borrow()).finish()
    }
}
