use std::collections::HashMap;
use std::sync::RwLock;

use engage_core::error::{EngageError, Result};
use engage_core::traits::ContactDirectory;
use engage_core::types::{Contact, ContactId};

/// In-memory contact directory.
#[derive(Default)]
pub struct ContactBook {
    contacts: RwLock<HashMap<ContactId, Contact>>,
}

impl ContactBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, contact: Contact) -> Result<()> {
        let mut contacts = self
            .contacts
            .write()
            .map_err(|e| EngageError::Database(e.to_string()))?;
        contacts.insert(contact.id.clone(), contact);
        Ok(())
    }

    /// Mark a contact as opted out of all outbound traffic.
    pub fn opt_out(&self, id: &ContactId) -> Result<()> {
        let mut contacts = self
            .contacts
            .write()
            .map_err(|e| EngageError::Database(e.to_string()))?;
        let contact = contacts
            .get_mut(id)
            .ok_or_else(|| EngageError::NotFound(format!("contact {}", id)))?;
        contact.opted_out = true;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.contacts.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContactDirectory for ContactBook {
    fn contact(&self, id: &ContactId) -> Result<Option<Contact>> {
        let contacts = self
            .contacts
            .read()
            .map_err(|e| EngageError::Database(e.to_string()))?;
        Ok(contacts.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engage_test_utils::phone_contact;

    #[test]
    fn insert_lookup_and_opt_out() {
        let book = ContactBook::new();
        book.insert(phone_contact("c1", "+15550001111")).unwrap();
        assert_eq!(book.len(), 1);

        let c = book.contact(&ContactId::from_string("c1")).unwrap().unwrap();
        assert!(!c.opted_out);

        book.opt_out(&c.id).unwrap();
        assert!(book.contact(&c.id).unwrap().unwrap().opted_out);
        assert!(book.contact(&ContactId::from_string("nobody")).unwrap().is_none());
        assert!(book.opt_out(&ContactId::from_string("nobody")).is_err());
    }
}
