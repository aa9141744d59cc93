//! Per-token object inventory.
//!
//! A token keeps its objects in two disjoint collections. The public one is
//! always visible; the private one only while a user or the security
//! officer is logged in. Handles come from a single counter per token so a
//! handle identifies at most one object across both collections and is
//! never handed out twice.

use std::{collections::BTreeMap, vec};

use crate::{
    attributes::{
        AttributeId, AttributeSet, AttributeTemplate, AttributeValue, ids, is_administrative,
        is_immutable, is_secret_component,
    },
    error::{P11Error, P11Result, Resource},
};

pub type ObjectHandle = u64;

/// What the caller's authentication state allows it to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visibility {
    /// Private collection is enumerable and searchable.
    pub private: bool,
    /// Vendor-range attributes can be read, matched and modified.
    pub admin: bool,
}

impl Visibility {
    pub const PUBLIC: Visibility = Visibility {
        private: false,
        admin: false,
    };
    pub const USER: Visibility = Visibility {
        private: true,
        admin: false,
    };
    pub const SECURITY_OFFICER: Visibility = Visibility {
        private: true,
        admin: true,
    };

    fn hides(&self, id: AttributeId) -> bool {
        !self.admin && is_administrative(id)
    }
}

/// Result of reading a single attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeLookup {
    Value(AttributeValue),
    /// Secret component of a sensitive or non-extractable object.
    Sensitive,
    /// Absent on the object or hidden from the caller.
    Invalid,
}

#[derive(Debug)]
pub struct ObjectStore {
    public: BTreeMap<ObjectHandle, AttributeSet>,
    private: BTreeMap<ObjectHandle, AttributeSet>,
    next_number: ObjectHandle,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn starting_at(next_number: ObjectHandle) -> Self {
        Self {
            public: BTreeMap::new(),
            private: BTreeMap::new(),
            next_number,
        }
    }

    /// Store `attributes` as a new object. `CKA_PRIVATE` is written back
    /// explicitly so the partition it landed in can always be read.
    pub fn insert(&mut self, mut attributes: AttributeSet) -> P11Result<ObjectHandle> {
        let handle = self.next_number;
        self.next_number = handle
            .checked_add(1)
            .ok_or(P11Error::Capacity(Resource::ObjectNumbers))?;

        let private = attributes.is_private();
        attributes.insert(ids::PRIVATE, AttributeValue::Bool(private));
        if private {
            self.private.insert(handle, attributes);
        } else {
            self.public.insert(handle, attributes);
        }
        Ok(handle)
    }

    pub fn get(&self, handle: ObjectHandle, visibility: Visibility) -> Option<&AttributeSet> {
        self.public.get(&handle).or_else(|| {
            visibility
                .private
                .then(|| self.private.get(&handle))
                .flatten()
        })
    }

    pub fn get_mut(
        &mut self,
        handle: ObjectHandle,
        visibility: Visibility,
    ) -> Option<&mut AttributeSet> {
        if self.public.contains_key(&handle) {
            return self.public.get_mut(&handle);
        }
        if visibility.private {
            return self.private.get_mut(&handle);
        }
        None
    }

    pub fn remove(&mut self, handle: ObjectHandle, visibility: Visibility) -> Option<AttributeSet> {
        self.public.remove(&handle).or_else(|| {
            if visibility.private {
                self.private.remove(&handle)
            } else {
                None
            }
        })
    }

    /// Handles of every visible object matching `template`, ascending.
    pub fn search(&self, template: &AttributeTemplate, visibility: Visibility) -> Vec<ObjectHandle> {
        // Hidden attributes behave as absent, so nothing can match them.
        if template.entries().iter().any(|(id, _)| visibility.hides(*id)) {
            return Vec::new();
        }
        let private = visibility
            .private
            .then_some(&self.private)
            .into_iter()
            .flatten();
        let mut handles: Vec<ObjectHandle> = self
            .public
            .iter()
            .chain(private)
            .filter(|(_, attributes)| attributes.matches_template(template))
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort_unstable();
        handles
    }

    pub fn len(&self) -> usize {
        self.public.len() + self.private.len()
    }

    pub fn is_empty(&self) -> bool {
        self.public.is_empty() && self.private.is_empty()
    }
}

/// Read `id` from `attributes` as seen with `visibility`.
pub fn read_attribute(
    attributes: &AttributeSet,
    id: AttributeId,
    visibility: Visibility,
) -> AttributeLookup {
    if visibility.hides(id) {
        return AttributeLookup::Invalid;
    }
    match attributes.get(id) {
        None => AttributeLookup::Invalid,
        Some(_) if is_secret_component(id) && attributes.is_sensitive() => {
            AttributeLookup::Sensitive
        }
        Some(value) => AttributeLookup::Value(value.clone()),
    }
}

/// Check a creation template against what the caller may set.
pub(crate) fn check_new_object(
    attributes: &AttributeSet,
    visibility: Visibility,
) -> P11Result<()> {
    attributes.validate_required(&[ids::CLASS])?;
    if let Some((id, _)) = attributes.iter().find(|(id, _)| visibility.hides(**id)) {
        return Err(P11Error::AttributeReadOnly(*id));
    }
    Ok(())
}

/// Apply `updates` to `attributes` or leave it untouched on any rejection.
pub(crate) fn apply_update(
    attributes: &mut AttributeSet,
    updates: &AttributeTemplate,
    visibility: Visibility,
) -> P11Result<()> {
    if attributes.flag(ids::MODIFIABLE) == Some(false) {
        return Err(P11Error::ActionProhibited);
    }
    for (id, _) in updates.entries() {
        if is_immutable(*id) || visibility.hides(*id) {
            return Err(P11Error::AttributeReadOnly(*id));
        }
    }
    for (id, value) in updates.entries() {
        attributes.insert(*id, value.clone());
    }
    Ok(())
}

/// Finite snapshot of search results in ascending handle order.
#[derive(Debug, Clone)]
pub struct ObjectSearch {
    handles: vec::IntoIter<ObjectHandle>,
}

impl ObjectSearch {
    pub fn new(handles: Vec<ObjectHandle>) -> Self {
        Self {
            handles: handles.into_iter(),
        }
    }

    /// Up to `max` further handles; empty once exhausted.
    pub fn next_batch(&mut self, max: usize) -> Vec<ObjectHandle> {
        self.handles.by_ref().take(max).collect()
    }
}

impl Iterator for ObjectSearch {
    type Item = ObjectHandle;

    fn next(&mut self) -> Option<Self::Item> {
        self.handles.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.handles.size_hint()
    }
}

impl ExactSizeIterator for ObjectSearch {}
