use crate::error::ChatError;
use crate::model::Role;
use rusqlite::{params, Connection, OptionalExtension};

/// Role policy for direct messaging. Pure so it can sit on the hot path.
///
/// Staff (teacher, admin) may message anyone. Students and parents may
/// always reach staff; across the student/parent boundary they may only
/// message within a linked family, which the caller resolves through a
/// [`FamilyPolicy`].
pub fn can_message(sender: Role, recipient: Role, family_linked: bool) -> bool {
    use Role::*;
    match (sender, recipient) {
        (Admin, _) | (Teacher, _) => true,
        (Student, Teacher) | (Student, Admin) => true,
        (Parent, Teacher) | (Parent, Admin) => true,
        (Student, Parent) | (Parent, Student) => family_linked,
        (Student, Student) | (Parent, Parent) => false,
    }
}

/// External lookup deciding whether two users belong to the same family.
pub trait FamilyPolicy {
    fn linked(&self, a: &str, b: &str) -> Result<bool, ChatError>;
}

/// Family links as maintained by the enrollment side of the platform.
pub struct DbFamilyPolicy<'c> {
    pub conn: &'c Connection,
}

impl FamilyPolicy for DbFamilyPolicy<'_> {
    fn linked(&self, a: &str, b: &str) -> Result<bool, ChatError> {
        let hit: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM family_links
                 WHERE (student_id = ?1 AND parent_id = ?2)
                    OR (student_id = ?2 AND parent_id = ?1)",
                params![a, b],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    struct Fixed(bool);

    impl FamilyPolicy for Fixed {
        fn linked(&self, _a: &str, _b: &str) -> Result<bool, ChatError> {
            Ok(self.0)
        }
    }

    #[test]
    fn staff_may_message_anyone() {
        use Role::*;
        for recipient in [Student, Parent, Teacher, Admin] {
            assert!(can_message(Teacher, recipient, false));
            assert!(can_message(Admin, recipient, false));
        }
    }

    #[test]
    fn students_and_parents_reach_staff_only() {
        use Role::*;
        assert!(can_message(Student, Teacher, false));
        assert!(can_message(Student, Admin, false));
        assert!(can_message(Parent, Teacher, false));
        assert!(can_message(Parent, Admin, false));
        assert!(!can_message(Student, Student, false));
        assert!(!can_message(Parent, Parent, false));
    }

    #[test]
    fn family_boundary_needs_a_link() {
        use Role::*;
        assert!(!can_message(Student, Parent, false));
        assert!(!can_message(Parent, Student, false));
        assert!(can_message(Student, Parent, true));
        assert!(can_message(Parent, Student, true));
    }

    #[test]
    fn policy_object_is_honored_both_ways() {
        use Role::*;
        let allow = Fixed(true);
        let deny = Fixed(false);
        assert!(can_message(Parent, Student, allow.linked("p", "s").unwrap()));
        assert!(!can_message(Parent, Student, deny.linked("p", "s").unwrap()));
    }

    #[test]
    fn db_policy_matches_either_column_order() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(db::SCHEMA).unwrap();
        conn.execute(
            "INSERT INTO family_links (student_id, parent_id) VALUES ('s1', 'p1')",
            [],
        )
        .unwrap();
        let policy = DbFamilyPolicy { conn: &conn };
        assert!(policy.linked("s1", "p1").unwrap());
        assert!(policy.linked("p1", "s1").unwrap());
        assert!(!policy.linked("s1", "p2").unwrap());
    }
}
