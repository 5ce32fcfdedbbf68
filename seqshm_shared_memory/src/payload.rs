//! Payload slot contents and typed slot accessors
//!
//! Slots live in mapped memory that other processes mutate concurrently, so
//! the accessors never form Rust references to slot contents. Every field is
//! read and written through volatile pointer operations at the offsets given
//! by [`PayloadLayout`]; consistency comes solely from the sequence protocol.

use crate::error::{ShmError, ShmResult};
use crate::layout::PayloadLayout;
use seqshm::consts::{PAYLOAD_ARRAY_LEN, SAMPLE_FLOAT, SAMPLE_INTEGER, sample_array_element};
use static_assertions::const_assert_eq;
use std::marker::PhantomData;
use std::ptr;

/// Owned copy of one slot
#[derive(Debug, Clone, PartialEq)]
#[repr(C)]
pub struct Payload {
    /// Integer field
    pub integer: i32,
    /// Floating-point field
    pub float: f32,
    /// Fixed-length array
    pub array: [i64; PAYLOAD_ARRAY_LEN],
}

const_assert_eq!(size_of::<Payload>(), PayloadLayout::new().size);
const_assert_eq!(core::mem::offset_of!(Payload, integer), PayloadLayout::new().integer);
const_assert_eq!(core::mem::offset_of!(Payload, float), PayloadLayout::new().float);
const_assert_eq!(core::mem::offset_of!(Payload, array), PayloadLayout::new().array);

impl Payload {
    /// Values both slots are seeded with at initialization
    pub fn sample() -> Self {
        let mut array = [0i64; PAYLOAD_ARRAY_LEN];
        for (j, v) in array.iter_mut().enumerate() {
            *v = sample_array_element(j);
        }
        Self {
            integer: SAMPLE_INTEGER,
            float: SAMPLE_FLOAT,
            array,
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self {
            integer: 0,
            float: 0.0,
            array: [0; PAYLOAD_ARRAY_LEN],
        }
    }
}

/// Read-only view of one slot in mapped memory
#[derive(Clone, Copy)]
pub struct SlotRef<'a> {
    base: *const u8,
    layout: PayloadLayout,
    _region: PhantomData<&'a [u8]>,
}

impl<'a> SlotRef<'a> {
    /// # Safety
    /// `base` must point to `layout.size` mapped bytes that stay mapped for `'a`.
    pub(crate) unsafe fn new(base: *const u8, layout: PayloadLayout) -> Self {
        Self {
            base,
            layout,
            _region: PhantomData,
        }
    }

    /// Integer field
    #[inline]
    pub fn integer(&self) -> i32 {
        unsafe { ptr::read_volatile(self.base.add(self.layout.integer) as *const i32) }
    }

    /// Float field
    #[inline]
    pub fn float(&self) -> f32 {
        unsafe { ptr::read_volatile(self.base.add(self.layout.float) as *const f32) }
    }

    /// Array element at `index`
    #[inline]
    pub fn get(&self, index: usize) -> ShmResult<i64> {
        if index >= self.layout.array_len {
            return Err(ShmError::IndexOutOfBounds {
                index,
                len: self.layout.array_len,
            });
        }
        Ok(unsafe { self.element(index) })
    }

    #[inline]
    unsafe fn element(&self, index: usize) -> i64 {
        unsafe {
            ptr::read_volatile(self.base.add(self.layout.array_element(index)) as *const i64)
        }
    }

    /// Copy the array into `out` (up to `out.len()` elements)
    pub fn copy_array_into(&self, out: &mut [i64]) {
        let n = out.len().min(self.layout.array_len);
        for (j, slot) in out[..n].iter_mut().enumerate() {
            *slot = unsafe { self.element(j) };
        }
    }

    /// Copy the whole slot into an owned payload
    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload {
            integer: self.integer(),
            float: self.float(),
            array: [0; PAYLOAD_ARRAY_LEN],
        };
        self.copy_array_into(&mut payload.array);
        payload
    }

    /// Number of array elements
    pub fn array_len(&self) -> usize {
        self.layout.array_len
    }
}

/// Mutable view of one slot in mapped memory
pub struct SlotMut<'a> {
    base: *mut u8,
    layout: PayloadLayout,
    _region: PhantomData<&'a mut [u8]>,
}

impl<'a> SlotMut<'a> {
    /// # Safety
    /// `base` must point to `layout.size` writable mapped bytes that stay
    /// mapped for `'a`, and the caller must hold the protocol right to
    /// mutate this slot.
    pub(crate) unsafe fn new(base: *mut u8, layout: PayloadLayout) -> Self {
        Self {
            base,
            layout,
            _region: PhantomData,
        }
    }

    /// Reborrow as a read-only view
    pub fn view(&self) -> SlotRef<'_> {
        unsafe { SlotRef::new(self.base, self.layout) }
    }

    /// Integer field
    #[inline]
    pub fn integer(&self) -> i32 {
        self.view().integer()
    }

    /// Float field
    #[inline]
    pub fn float(&self) -> f32 {
        self.view().float()
    }

    /// Array element at `index`
    #[inline]
    pub fn get(&self, index: usize) -> ShmResult<i64> {
        self.view().get(index)
    }

    /// Set the integer field
    #[inline]
    pub fn set_integer(&mut self, value: i32) {
        unsafe { ptr::write_volatile(self.base.add(self.layout.integer) as *mut i32, value) }
    }

    /// Set the float field
    #[inline]
    pub fn set_float(&mut self, value: f32) {
        unsafe { ptr::write_volatile(self.base.add(self.layout.float) as *mut f32, value) }
    }

    /// Set array element at `index`
    #[inline]
    pub fn set(&mut self, index: usize, value: i64) -> ShmResult<()> {
        if index >= self.layout.array_len {
            return Err(ShmError::IndexOutOfBounds {
                index,
                len: self.layout.array_len,
            });
        }
        unsafe { self.store(index, value) };
        Ok(())
    }

    #[inline]
    unsafe fn store(&mut self, index: usize, value: i64) {
        unsafe {
            ptr::write_volatile(
                self.base.add(self.layout.array_element(index)) as *mut i64,
                value,
            )
        }
    }

    /// Overwrite the array prefix with `values`
    pub fn fill_array(&mut self, values: &[i64]) {
        let n = values.len().min(self.layout.array_len);
        for (j, &v) in values[..n].iter().enumerate() {
            unsafe { self.store(j, v) };
        }
    }

    /// Replace every array element with `f(index, old)`
    pub fn update_array(&mut self, mut f: impl FnMut(usize, i64) -> i64) {
        for j in 0..self.layout.array_len {
            let old = unsafe { self.view().element(j) };
            unsafe { self.store(j, f(j, old)) };
        }
    }

    /// Copy the array of `src` into this slot
    pub fn copy_array_from(&mut self, src: &SlotRef<'_>) {
        for j in 0..self.layout.array_len.min(src.layout.array_len) {
            let v = unsafe { src.element(j) };
            unsafe { self.store(j, v) };
        }
    }

    /// Write every field of `payload`
    pub fn write_payload(&mut self, payload: &Payload) {
        self.set_integer(payload.integer);
        self.set_float(payload.float);
        self.fill_array(&payload.array);
    }
}

/// Field values for a non-RT write
///
/// Fields left as `None` are carried over from the slot that was active when
/// the write began, so the shadow slot is fully consistent at commit time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadUpdate {
    /// New integer value
    pub integer: Option<i32>,
    /// New float value
    pub float: Option<f32>,
    /// New array contents
    pub array: Option<Box<[i64; PAYLOAD_ARRAY_LEN]>>,
}

impl PayloadUpdate {
    /// Empty update (copies the active slot verbatim)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the integer field
    pub fn with_integer(mut self, value: i32) -> Self {
        self.integer = Some(value);
        self
    }

    /// Set the float field
    pub fn with_float(mut self, value: f32) -> Self {
        self.float = Some(value);
        self
    }

    /// Set the array, zero-padding shorter input
    pub fn with_array(mut self, values: &[i64]) -> Self {
        let mut array = Box::new([0i64; PAYLOAD_ARRAY_LEN]);
        let n = values.len().min(PAYLOAD_ARRAY_LEN);
        array[..n].copy_from_slice(&values[..n]);
        self.array = Some(array);
        self
    }

    /// Write touched fields into `shadow`, then carry untouched ones over
    /// from `active`
    pub fn apply(&self, shadow: &mut SlotMut<'_>, active: &SlotRef<'_>) {
        if let Some(v) = self.float {
            shadow.set_float(v);
        }
        if let Some(v) = self.integer {
            shadow.set_integer(v);
        }
        if let Some(array) = &self.array {
            shadow.fill_array(&array[..]);
        }

        if self.float.is_none() {
            shadow.set_float(active.float());
        }
        if self.integer.is_none() {
            shadow.set_integer(active.integer());
        }
        if self.array.is_none() {
            shadow.copy_array_from(active);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scratch {
        bytes: Vec<u64>,
        layout: PayloadLayout,
    }

    impl Scratch {
        fn new() -> Self {
            let layout = PayloadLayout::new();
            Self {
                bytes: vec![0u64; layout.size / 8],
                layout,
            }
        }

        fn slot_mut(&mut self) -> SlotMut<'_> {
            unsafe { SlotMut::new(self.bytes.as_mut_ptr() as *mut u8, self.layout) }
        }
    }

    #[test]
    fn test_sample_payload() {
        let p = Payload::sample();
        assert_eq!(p.integer, 42);
        assert_eq!(p.float, 23.42);
        assert_eq!(p.array[0], 1024);
        assert_eq!(p.array[1023], 1);
    }

    #[test]
    fn test_slot_roundtrip_through_accessors() {
        let mut scratch = Scratch::new();
        let mut slot = scratch.slot_mut();
        slot.write_payload(&Payload::sample());
        assert_eq!(slot.view().to_payload(), Payload::sample());

        slot.set_integer(-7);
        slot.set(5, 99).unwrap();
        assert_eq!(slot.integer(), -7);
        assert_eq!(slot.get(5).unwrap(), 99);
    }

    #[test]
    fn test_array_bounds_are_checked() {
        let mut scratch = Scratch::new();
        let mut slot = scratch.slot_mut();
        assert!(matches!(
            slot.set(PAYLOAD_ARRAY_LEN, 1),
            Err(ShmError::IndexOutOfBounds { .. })
        ));
        assert!(slot.get(PAYLOAD_ARRAY_LEN).is_err());
    }

    #[test]
    fn test_update_carries_untouched_fields() {
        let mut active = Scratch::new();
        let mut shadow = Scratch::new();
        active.slot_mut().write_payload(&Payload::sample());

        let update = PayloadUpdate::new().with_integer(100).with_float(3.14);
        let active_ref = active.slot_mut().view().to_payload();
        {
            let a = active.slot_mut();
            let mut s = shadow.slot_mut();
            update.apply(&mut s, &a.view());
        }

        let result = shadow.slot_mut().view().to_payload();
        assert_eq!(result.integer, 100);
        assert_eq!(result.float, 3.14);
        assert_eq!(result.array, active_ref.array);
    }

    #[test]
    fn test_update_with_short_array_zero_pads() {
        let update = PayloadUpdate::new().with_array(&[1, 2, 3]);
        let array = update.array.unwrap();
        assert_eq!(&array[..4], &[1, 2, 3, 0]);
    }
}
