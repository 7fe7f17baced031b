//! Heap objects.
//!
//! An object is a header word holding its map, a run of tagged fields and an
//! opaque byte payload. Code objects additionally carry relocation entries
//! that reference other objects from inside the instruction stream.
//!
//! The header word doubles as the forwarding word during evacuation: once an
//! object has been copied, [`HeapObject::map_word`] yields
//! [`MapWord::ForwardingAddress`] and the original must no longer be used.

use bitflags::bitflags;
use core_types::{Address, Tagged, TAGGED_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Size of the header word.
pub const HEADER_SIZE: usize = TAGGED_SIZE;

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

/// Category of a heap object; selects its body layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Ordinary object, every field may hold a strong or weak reference
    Plain,
    /// Array of maybe-weak references
    FixedArray,
    /// Raw bytes without references
    ByteArray,
    /// Array whose entries are usually weak references
    WeakArray,
    /// Key/value table whose values live only as long as their keys
    EphemeronTable,
    /// Script-visible weak reference
    JsWeakRef,
    /// Registration record of a finalization registry
    WeakCell,
    /// Finalization registry
    FinalizationRegistry,
    /// Object shape descriptor
    Map,
    /// Weak transitions from a map to its child maps
    TransitionArray,
    /// Property descriptors shared along a transition chain
    DescriptorArray,
    /// Executable code with relocation entries
    Code,
    /// Function metadata that may own bytecode
    SharedFunctionInfo,
    /// Interpreter bytecode
    BytecodeArray,
    /// Function closure
    JsFunction,
    /// String that forwards to its internalized copy
    ThinString,
    /// Sequential string payload
    SeqString,
    /// Unused memory
    Filler,
}

impl ObjectKind {
    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Plain => "Plain",
            ObjectKind::FixedArray => "FixedArray",
            ObjectKind::ByteArray => "ByteArray",
            ObjectKind::WeakArray => "WeakArray",
            ObjectKind::EphemeronTable => "EphemeronTable",
            ObjectKind::JsWeakRef => "JsWeakRef",
            ObjectKind::WeakCell => "WeakCell",
            ObjectKind::FinalizationRegistry => "FinalizationRegistry",
            ObjectKind::Map => "Map",
            ObjectKind::TransitionArray => "TransitionArray",
            ObjectKind::DescriptorArray => "DescriptorArray",
            ObjectKind::Code => "Code",
            ObjectKind::SharedFunctionInfo => "SharedFunctionInfo",
            ObjectKind::BytecodeArray => "BytecodeArray",
            ObjectKind::JsFunction => "JsFunction",
            ObjectKind::ThinString => "ThinString",
            ObjectKind::SeqString => "SeqString",
            ObjectKind::Filler => "Filler",
        }
    }

    /// Returns true for strings that may live in a shared string table.
    pub fn is_internalizable_string(self) -> bool {
        matches!(self, ObjectKind::SeqString)
    }

    /// Returns true for objects that optimized code references weakly.
    pub fn is_weak_in_optimized_code(self) -> bool {
        matches!(self, ObjectKind::Map | ObjectKind::Plain | ObjectKind::JsFunction)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Field indices of the fixed-layout object kinds.
pub mod layout {
    /// [`ObjectKind::Map`](super::ObjectKind::Map) fields.
    pub mod map {
        /// Parent map or constructor
        pub const BACK_POINTER: usize = 0;
        /// Transition array, or a weak reference to the single child map
        pub const TRANSITIONS: usize = 1;
        /// Descriptor array
        pub const DESCRIPTORS: usize = 2;
        /// Prototype object
        pub const PROTOTYPE: usize = 3;
        /// Number of fields
        pub const FIELD_COUNT: usize = 4;
    }

    /// [`ObjectKind::SharedFunctionInfo`](super::ObjectKind::SharedFunctionInfo) fields.
    pub mod shared_function_info {
        /// Bytecode array or the uncompiled marker
        pub const FUNCTION_DATA: usize = 0;
        /// Function name
        pub const NAME: usize = 1;
        /// Number of fields
        pub const FIELD_COUNT: usize = 2;
    }

    /// [`ObjectKind::JsFunction`](super::ObjectKind::JsFunction) fields.
    pub mod js_function {
        /// Shared function info
        pub const SHARED: usize = 0;
        /// Attached code, or the lazy-compile marker
        pub const CODE: usize = 1;
        /// Closure context
        pub const CONTEXT: usize = 2;
        /// Number of fields
        pub const FIELD_COUNT: usize = 3;
    }

    /// [`ObjectKind::JsWeakRef`](super::ObjectKind::JsWeakRef) fields.
    pub mod js_weak_ref {
        /// Weakly held target
        pub const TARGET: usize = 0;
        /// Number of fields
        pub const FIELD_COUNT: usize = 1;
    }

    /// [`ObjectKind::WeakCell`](super::ObjectKind::WeakCell) fields.
    pub mod weak_cell {
        /// Weakly held target
        pub const TARGET: usize = 0;
        /// Weakly held unregister token
        pub const UNREGISTER_TOKEN: usize = 1;
        /// Owning registry
        pub const REGISTRY: usize = 2;
        /// Value passed to the cleanup callback
        pub const HOLDINGS: usize = 3;
        /// Previous cell in the registry list
        pub const PREV: usize = 4;
        /// Next cell in the registry list
        pub const NEXT: usize = 5;
        /// Number of fields
        pub const FIELD_COUNT: usize = 6;
    }

    /// [`ObjectKind::FinalizationRegistry`](super::ObjectKind::FinalizationRegistry) fields.
    pub mod finalization_registry {
        /// Head of the list of cells with live targets
        pub const ACTIVE_CELLS: usize = 0;
        /// Head of the list of cells whose targets died
        pub const CLEARED_CELLS: usize = 1;
        /// Number of fields
        pub const FIELD_COUNT: usize = 2;
    }

    /// [`ObjectKind::ThinString`](super::ObjectKind::ThinString) fields.
    pub mod thin_string {
        /// Internalized string
        pub const ACTUAL: usize = 0;
        /// Number of fields
        pub const FIELD_COUNT: usize = 1;
    }

    /// Key field of ephemeron or transition entry `entry`.
    pub const fn entry_key(entry: usize) -> usize {
        entry * 2
    }

    /// Value field of ephemeron or transition entry `entry`.
    pub const fn entry_value(entry: usize) -> usize {
        entry * 2 + 1
    }
}

bitflags! {
    /// Per-object state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ObjectFlags: u32 {
        /// Code produced by the optimizing compiler
        const OPTIMIZED = 1 << 0;
        /// Optimized code that can be deoptimized
        const CAN_DEOPTIMIZE = 1 << 1;
        /// Code scheduled for deoptimization
        const MARKED_FOR_DEOPTIMIZATION = 1 << 2;
        /// Dead embedded objects were cleared from the code
        const EMBEDDED_OBJECTS_CLEARED = 1 << 3;
        /// Map owns its descriptor array
        const OWNS_DESCRIPTORS = 1 << 4;
        /// Registry is already queued for cleanup
        const SCHEDULED_FOR_CLEANUP = 1 << 5;
    }
}

/// Header word contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapWord {
    /// The object's map
    Map(Tagged),
    /// The object was evacuated to this address
    ForwardingAddress(Address),
}

/// A slot of an object that may hold a tagged value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotIndex {
    /// The header word
    Map,
    /// Field `i`
    Field(usize),
}

impl SlotIndex {
    /// Byte offset of the slot from the object start.
    pub fn offset(self) -> usize {
        match self {
            SlotIndex::Map => 0,
            SlotIndex::Field(index) => HEADER_SIZE + index * TAGGED_SIZE,
        }
    }
}

/// Relocation entry kinds of a code object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocMode {
    /// Call target pointing to another code object
    CodeTarget,
    /// Full-width embedded object pointer
    FullEmbeddedObject,
    /// Compressed embedded object pointer
    CompressedEmbeddedObject,
    /// Constant-pool entry holding a full object pointer
    ConstPoolFullEmbeddedObject,
    /// Constant-pool entry holding a compressed object pointer
    ConstPoolCompressedEmbeddedObject,
    /// Constant-pool entry holding a code target
    ConstPoolCodeTarget,
    /// Absolute address inside the same code object
    InternalReference,
}

impl RelocMode {
    /// Returns true if the entry references another heap object.
    pub fn is_heap_reference(self) -> bool {
        !matches!(self, RelocMode::InternalReference)
    }

    /// Returns true if the entry references a code object.
    pub fn is_code_target(self) -> bool {
        matches!(self, RelocMode::CodeTarget | RelocMode::ConstPoolCodeTarget)
    }
}

/// One relocation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocInfo {
    /// Entry kind
    pub mode: RelocMode,
    /// Byte offset of the patched word from the code object start
    pub offset: usize,
    /// Raw target address, zero once cleared
    pub value: usize,
}

impl RelocInfo {
    /// Target address, if any.
    pub fn target(&self) -> Option<Address> {
        (self.value != 0).then(|| Address::new(self.value))
    }
}

/// Instruction-stream data of a code object.
#[derive(Debug, Clone, Default)]
pub struct CodeBody {
    /// Relocation entries sorted by offset
    pub relocs: Vec<RelocInfo>,
}

/// Unregister-token bookkeeping of a finalization registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryKeyMap {
    cells_by_token: HashMap<u64, Vec<u64>>,
}

impl RegistryKeyMap {
    /// Registers `cell` under `token`.
    pub fn insert(&mut self, token: u64, cell: u64) {
        self.cells_by_token.entry(token).or_default().push(cell);
    }

    /// Removes `cell` from the cells registered under `token`.
    pub fn remove(&mut self, token: u64, cell: u64) {
        if let Some(cells) = self.cells_by_token.get_mut(&token) {
            cells.retain(|&c| c != cell);
            if cells.is_empty() {
                self.cells_by_token.remove(&token);
            }
        }
    }

    /// Cells registered under `token`.
    pub fn cells(&self, token: u64) -> &[u64] {
        self.cells_by_token.get(&token).map_or(&[], Vec::as_slice)
    }

    /// Number of tokens with registered cells.
    pub fn len(&self) -> usize {
        self.cells_by_token.len()
    }

    /// Returns true when no token has registered cells.
    pub fn is_empty(&self) -> bool {
        self.cells_by_token.is_empty()
    }
}

/// Computes the allocation size of an object.
pub fn object_size(field_count: usize, payload_size: usize) -> usize {
    Address::align_size(HEADER_SIZE + field_count * TAGGED_SIZE + payload_size)
}

/// A heap object.
pub struct HeapObject {
    address: Address,
    kind: ObjectKind,
    size: usize,
    identity: u64,
    map: AtomicU64,
    forwarding: AtomicUsize,
    fields: Box<[AtomicU64]>,
    used: AtomicUsize,
    aux: AtomicU32,
    flags: AtomicU32,
    native_context: AtomicU64,
    code: Option<Mutex<CodeBody>>,
    key_map: Option<Mutex<RegistryKeyMap>>,
}

impl HeapObject {
    /// Creates an object at `address` with every field set to `undefined`.
    pub fn new(
        address: Address,
        kind: ObjectKind,
        map: Tagged,
        field_count: usize,
        payload_size: usize,
    ) -> Self {
        let fields = (0..field_count)
            .map(|_| AtomicU64::new(Tagged::UNDEFINED.raw()))
            .collect();
        HeapObject {
            address,
            kind,
            size: object_size(field_count, payload_size),
            identity: NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed),
            map: AtomicU64::new(map.raw()),
            forwarding: AtomicUsize::new(0),
            fields,
            used: AtomicUsize::new(field_count),
            aux: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            native_context: AtomicU64::new(0),
            code: (kind == ObjectKind::Code).then(|| Mutex::new(CodeBody::default())),
            key_map: (kind == ObjectKind::FinalizationRegistry)
                .then(|| Mutex::new(RegistryKeyMap::default())),
        }
    }

    /// Start address.
    #[inline]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Object category.
    #[inline]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Allocation size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Identity that survives evacuation.
    #[inline]
    pub fn identity(&self) -> u64 {
        self.identity
    }

    /// Address one past the last byte.
    #[inline]
    pub fn end(&self) -> Address {
        self.address + self.size
    }

    /// Returns true if `address` lies inside the object.
    #[inline]
    pub fn contains(&self, address: Address) -> bool {
        address >= self.address && address < self.end()
    }

    /// Reads the header word.
    pub fn map_word(&self) -> MapWord {
        match self.forwarding.load(Ordering::Acquire) {
            0 => MapWord::Map(Tagged::from_raw(self.map.load(Ordering::Relaxed))),
            raw => MapWord::ForwardingAddress(Address::new(raw)),
        }
    }

    /// The map, ignoring forwarding.
    pub fn map(&self) -> Tagged {
        Tagged::from_raw(self.map.load(Ordering::Relaxed))
    }

    /// Installs the forwarding address. Succeeds only once.
    pub fn set_forwarding_address(&self, target: Address) -> bool {
        self.forwarding
            .compare_exchange(0, target.raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Forwarding address, if the object was evacuated.
    pub fn forwarding_address(&self) -> Option<Address> {
        match self.forwarding.load(Ordering::Acquire) {
            0 => None,
            raw => Some(Address::new(raw)),
        }
    }

    /// Returns true if the object was evacuated.
    pub fn is_forwarded(&self) -> bool {
        self.forwarding.load(Ordering::Acquire) != 0
    }

    /// Number of fields.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Reads field `index`; out-of-range reads yield `undefined`.
    pub fn field(&self, index: usize) -> Tagged {
        debug_assert!(index < self.fields.len(), "field {index} out of range");
        self.fields
            .get(index)
            .map_or(Tagged::UNDEFINED, |f| Tagged::from_raw(f.load(Ordering::Relaxed)))
    }

    /// Writes field `index` without any barrier.
    pub fn set_field(&self, index: usize, value: Tagged) {
        debug_assert!(index < self.fields.len(), "field {index} out of range");
        if let Some(field) = self.fields.get(index) {
            field.store(value.raw(), Ordering::Relaxed);
        }
    }

    /// Reads a slot.
    pub fn load(&self, slot: SlotIndex) -> Tagged {
        match slot {
            SlotIndex::Map => self.map(),
            SlotIndex::Field(index) => self.field(index),
        }
    }

    /// Writes a slot without any barrier.
    pub fn store(&self, slot: SlotIndex, value: Tagged) {
        match slot {
            SlotIndex::Map => self.map.store(value.raw(), Ordering::Relaxed),
            SlotIndex::Field(index) => self.set_field(index, value),
        }
    }

    /// Replaces `expected` by `value` if the slot still holds `expected`.
    pub fn compare_and_swap(&self, slot: SlotIndex, expected: Tagged, value: Tagged) -> bool {
        let cell = match slot {
            SlotIndex::Map => &self.map,
            SlotIndex::Field(index) => match self.fields.get(index) {
                Some(field) => field,
                None => return false,
            },
        };
        cell.compare_exchange(
            expected.raw(),
            value.raw(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        )
        .is_ok()
    }

    /// Address of a slot.
    pub fn slot_address(&self, slot: SlotIndex) -> Address {
        self.address + slot.offset()
    }

    /// Slot at byte `offset` from the object start, if the offset names one.
    pub fn slot_at_offset(&self, offset: usize) -> Option<SlotIndex> {
        if offset == 0 {
            return Some(SlotIndex::Map);
        }
        if offset < HEADER_SIZE || (offset - HEADER_SIZE) % TAGGED_SIZE != 0 {
            return None;
        }
        let index = (offset - HEADER_SIZE) / TAGGED_SIZE;
        (index < self.fields.len()).then_some(SlotIndex::Field(index))
    }

    /// Number of fields in use; trimming lowers it.
    pub fn used_fields(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Sets the number of fields in use.
    pub fn set_used_fields(&self, used: usize) {
        self.used.store(used.min(self.fields.len()), Ordering::Relaxed);
    }

    /// Releases the fields past `new_used`, overwriting them with `undefined`.
    pub fn right_trim(&self, new_used: usize) {
        let old_used = self.used_fields();
        for index in new_used..old_used {
            self.set_field(index, Tagged::UNDEFINED);
        }
        self.set_used_fields(new_used);
    }

    /// Number of ephemeron or transition entries in use.
    pub fn entry_count(&self) -> usize {
        self.used_fields() / 2
    }

    /// Object state bits.
    pub fn flags(&self) -> ObjectFlags {
        ObjectFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Sets state bits.
    pub fn set_flags(&self, flags: ObjectFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clears state bits.
    pub fn clear_flags(&self, flags: ObjectFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Returns true if all of `flags` are set.
    pub fn has_flags(&self, flags: ObjectFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Bytecode age of a shared function info.
    pub fn bytecode_age(&self) -> u8 {
        self.aux.load(Ordering::Relaxed) as u8
    }

    /// Sets the bytecode age.
    pub fn set_bytecode_age(&self, age: u8) {
        self.aux.store(u32::from(age), Ordering::Relaxed);
    }

    /// Number of descriptors a map owns in its descriptor array.
    pub fn number_of_own_descriptors(&self) -> usize {
        self.aux.load(Ordering::Relaxed) as usize
    }

    /// Sets the number of own descriptors.
    pub fn set_number_of_own_descriptors(&self, count: usize) {
        self.aux.store(count as u32, Ordering::Relaxed);
    }

    /// Native context id of a map, zero when unknown.
    pub fn native_context(&self) -> u64 {
        self.native_context.load(Ordering::Relaxed)
    }

    /// Sets the native context id.
    pub fn set_native_context(&self, context: u64) {
        self.native_context.store(context, Ordering::Relaxed);
    }

    /// Code body, for code objects.
    pub fn code_body(&self) -> Option<&Mutex<CodeBody>> {
        self.code.as_ref()
    }

    /// Snapshot of the relocation entries.
    pub fn relocs(&self) -> Vec<RelocInfo> {
        self.code
            .as_ref()
            .map(|body| body.lock().relocs.clone())
            .unwrap_or_default()
    }

    /// Relocation entry at byte `offset`.
    pub fn reloc_at_offset(&self, offset: usize) -> Option<RelocInfo> {
        let body = self.code.as_ref()?.lock();
        body.relocs.iter().find(|r| r.offset == offset).copied()
    }

    /// Patches the target of the relocation entry at `offset`.
    pub fn set_reloc_value(&self, offset: usize, value: usize) -> bool {
        let Some(body) = self.code.as_ref() else {
            return false;
        };
        let mut body = body.lock();
        match body.relocs.iter_mut().find(|r| r.offset == offset) {
            Some(reloc) => {
                reloc.value = value;
                true
            }
            None => false,
        }
    }

    /// Unregister-token map, for finalization registries.
    pub fn key_map(&self) -> Option<&Mutex<RegistryKeyMap>> {
        self.key_map.as_ref()
    }

    /// Copies the object to `target`.
    ///
    /// Internal references of code are shifted by the move distance so they
    /// keep pointing into the copy.
    pub fn copy_to(&self, target: Address) -> HeapObject {
        let delta = target - self.address;
        let code = self.code.as_ref().map(|body| {
            let mut body = body.lock().clone();
            for reloc in body
                .relocs
                .iter_mut()
                .filter(|r| r.mode == RelocMode::InternalReference && r.value != 0)
            {
                reloc.value = (reloc.value as isize + delta) as usize;
            }
            Mutex::new(body)
        });
        HeapObject {
            address: target,
            kind: self.kind,
            size: self.size,
            identity: self.identity,
            map: AtomicU64::new(self.map.load(Ordering::Relaxed)),
            forwarding: AtomicUsize::new(0),
            fields: self
                .fields
                .iter()
                .map(|f| AtomicU64::new(f.load(Ordering::Relaxed)))
                .collect(),
            used: AtomicUsize::new(self.used.load(Ordering::Relaxed)),
            aux: AtomicU32::new(self.aux.load(Ordering::Relaxed)),
            flags: AtomicU32::new(self.flags.load(Ordering::Relaxed)),
            native_context: AtomicU64::new(self.native_context.load(Ordering::Relaxed)),
            code,
            key_map: self
                .key_map
                .as_ref()
                .map(|map| Mutex::new(map.lock().clone())),
        }
    }
}

impl fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapObject")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("identity", &self.identity)
            .field("forwarded", &self.forwarding_address())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(kind: ObjectKind, fields: usize) -> HeapObject {
        HeapObject::new(Address::new(0x40000), kind, Tagged::UNDEFINED, fields, 0)
    }

    #[test]
    fn test_size_includes_header_and_payload() {
        assert_eq!(object_size(0, 0), 8);
        assert_eq!(object_size(2, 0), 24);
        assert_eq!(object_size(1, 3), 24);
    }

    #[test]
    fn test_forwarding_is_write_once() {
        let obj = object(ObjectKind::Plain, 1);
        assert_eq!(obj.map_word(), MapWord::Map(Tagged::UNDEFINED));
        assert!(obj.set_forwarding_address(Address::new(0x80000)));
        assert!(!obj.set_forwarding_address(Address::new(0x90000)));
        assert_eq!(
            obj.map_word(),
            MapWord::ForwardingAddress(Address::new(0x80000))
        );
    }

    #[test]
    fn test_slot_offsets_round_trip() {
        let obj = object(ObjectKind::FixedArray, 3);
        for slot in [SlotIndex::Map, SlotIndex::Field(0), SlotIndex::Field(2)] {
            assert_eq!(obj.slot_at_offset(slot.offset()), Some(slot));
        }
        assert_eq!(obj.slot_at_offset(4), None);
        assert_eq!(obj.slot_at_offset(SlotIndex::Field(3).offset()), None);
    }

    #[test]
    fn test_copy_shifts_internal_references() {
        let code = HeapObject::new(Address::new(0x40000), ObjectKind::Code, Tagged::UNDEFINED, 0, 64);
        if let Some(body) = code.code_body() {
            body.lock().relocs = vec![
                RelocInfo {
                    mode: RelocMode::InternalReference,
                    offset: 16,
                    value: 0x40020,
                },
                RelocInfo {
                    mode: RelocMode::FullEmbeddedObject,
                    offset: 24,
                    value: 0x50000,
                },
            ];
        }
        let copy = code.copy_to(Address::new(0x80000));
        let relocs = copy.relocs();
        assert_eq!(relocs[0].value, 0x80020);
        assert_eq!(relocs[1].value, 0x50000);
        assert_eq!(copy.identity(), code.identity());
    }

    #[test]
    fn test_right_trim_clears_tail() {
        let obj = object(ObjectKind::TransitionArray, 6);
        obj.set_field(5, Tagged::smi(7));
        obj.right_trim(2);
        assert_eq!(obj.used_fields(), 2);
        assert_eq!(obj.entry_count(), 1);
        assert!(obj.field(5).is_undefined());
    }

    #[test]
    fn test_registry_key_map() {
        let mut map = RegistryKeyMap::default();
        map.insert(1, 10);
        map.insert(1, 11);
        map.remove(1, 10);
        assert_eq!(map.cells(1), &[11]);
        map.remove(1, 11);
        assert!(map.is_empty());
    }
}
