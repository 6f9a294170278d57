//! Enrollment-scoped course links.
//!
//! Link rows carry a composite foreign key into `tbl_user_course`, so a link
//! cannot outlive or precede its enrollment even if a caller skips
//! validation. Violations of that key surface as `NotEnrolled`.

use async_trait::async_trait;
use tracing::{debug, info};

use formulary_core::{
    EnrollmentLink, EnrollmentRepository, EntityKind, Error, Result, Subject, SurrogateKey,
};

use crate::catalog::{require_row, PgCatalog};

fn course_link_table(kind: EntityKind) -> Result<&'static str> {
    kind.course_link_table().ok_or_else(|| {
        Error::InvalidInput(format!("{} rows cannot be linked to courses", kind))
    })
}

/// Name of the composite enrollment key on a course link table.
fn enrollment_constraint(kind: EntityKind) -> String {
    format!("fk_user_course_{}_enrollment", kind)
}

#[async_trait]
impl EnrollmentRepository for PgCatalog {
    async fn enroll(&self, user_id: SurrogateKey, course_id: SurrogateKey) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO tbl_user_course (user_id, course_id) VALUES ($1, $2) \
             ON CONFLICT (user_id, course_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(course_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database);

        match result {
            Ok(r) => Ok(r.rows_affected() > 0),
            Err(e) if e.is_foreign_key_violation() => Err(Error::NotFound(
                Subject::new(EntityKind::Course, course_id).to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    async fn validate_enrollment_link(
        &self,
        user_id: SurrogateKey,
        course_id: SurrogateKey,
        item: Subject,
    ) -> Result<()> {
        course_link_table(item.kind)?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        require_row(&mut tx, item, false).await?;

        let enrolled = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM tbl_user_course WHERE user_id = $1 AND course_id = $2",
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        enrolled
            .map(|_| ())
            .ok_or(Error::NotEnrolled { user_id, course_id })
    }

    async fn link_course_item(&self, link: &EnrollmentLink) -> Result<()> {
        let table = course_link_table(link.item.kind)?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Hold the enrollment so a concurrent unenroll waits for this link.
        let enrolled = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM tbl_user_course WHERE user_id = $1 AND course_id = $2 FOR SHARE",
        )
        .bind(link.user_id)
        .bind(link.course_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;
        if enrolled.is_none() {
            return Err(Error::NotEnrolled {
                user_id: link.user_id,
                course_id: link.course_id,
            });
        }
        require_row(&mut tx, link.item, false).await?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO {table} (user_id, course_id, {key}, segment_type, segment_label) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (user_id, course_id, {key}) DO UPDATE \
             SET segment_type = EXCLUDED.segment_type, segment_label = EXCLUDED.segment_label",
            key = link.item.kind.key_column(),
        ))
        .bind(link.user_id)
        .bind(link.course_id)
        .bind(link.item.key)
        .bind(link.segment.segment_type.map(|s| s.as_str()))
        .bind(link.segment.segment_label.as_deref())
        .execute(&mut *tx)
        .await
        .map_err(Error::Database);

        if let Err(e) = inserted {
            if e.is_foreign_key_violation()
                && e.constraint() == Some(enrollment_constraint(link.item.kind).as_str())
            {
                return Err(Error::NotEnrolled {
                    user_id: link.user_id,
                    course_id: link.course_id,
                });
            }
            return Err(e);
        }
        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "catalog",
            component = "enrollment",
            op = "link_course_item",
            entity_kind = %link.item.kind,
            surrogate_key = link.item.key,
            "Course item linked"
        );
        Ok(())
    }

    async fn unlink_course_item(
        &self,
        user_id: SurrogateKey,
        course_id: SurrogateKey,
        item: Subject,
    ) -> Result<bool> {
        let table = course_link_table(item.kind)?;
        let result = sqlx::query(&format!(
            "DELETE FROM {table} WHERE user_id = $1 AND course_id = $2 AND {key} = $3",
            key = item.kind.key_column(),
        ))
        .bind(user_id)
        .bind(course_id)
        .bind(item.key)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn unenroll(&self, user_id: SurrogateKey, course_id: SurrogateKey) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Serialise against enrollments into the same course.
        sqlx::query("SELECT 1 FROM tbl_course WHERE course_id = $1 FOR UPDATE")
            .bind(course_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        for kind in [EntityKind::Formula, EntityKind::Term] {
            let table = course_link_table(kind)?;
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE user_id = $1 AND course_id = $2"
            ))
            .bind(user_id)
            .bind(course_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        let removed = sqlx::query(
            "DELETE FROM tbl_user_course WHERE user_id = $1 AND course_id = $2",
        )
        .bind(user_id)
        .bind(course_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?
        .rows_affected()
            > 0;

        let mut course_dropped = false;
        if removed {
            course_dropped = sqlx::query(
                "DELETE FROM tbl_course WHERE course_id = $1 \
                 AND NOT EXISTS (SELECT 1 FROM tbl_user_course WHERE course_id = $1)",
            )
            .bind(course_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?
            .rows_affected()
                > 0;
        }
        tx.commit().await.map_err(Error::Database)?;

        if removed {
            info!(
                subsystem = "catalog",
                component = "enrollment",
                op = "unenroll",
                user_id,
                course_id,
                course_dropped,
                "User unenrolled"
            );
        }
        Ok(removed)
    }
}
