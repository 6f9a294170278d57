//! The catalog's own ordered migration steps.
//!
//! Two plans run around the backfills. The additive plan only creates,
//! renames and adds; everything it introduces tolerates legacy rows. The
//! tightening plan validates what the backfills made true and must not run
//! before them.

use formulary_core::{Guard, MigrationPlan, MigrationStep, SchemaChange};

/// Name of the plan run before backfills.
pub const ADDITIVE_PLAN: &str = "additive";
/// Name of the plan run after backfills.
pub const TIGHTENING_PLAN: &str = "tightening";

macro_rules! add_column {
    ($name:expr, $table:literal, $column:expr, $definition:literal) => {
        MigrationStep::new(
            $name,
            concat!("Add ", $table, ".", $column),
            SchemaChange::AddColumn {
                table: $table,
                column: $column,
                definition: $definition,
            },
        )
    };
}

/// Handle column plus its sparse unique index.
macro_rules! handle_steps {
    ($kind:literal, $table:literal) => {
        [
            add_column!(
                concat!("add_", $kind, "_handle"),
                $table,
                concat!($kind, "_handle"),
                "TEXT"
            ),
            MigrationStep::new(
                concat!("index_", $kind, "_handle"),
                concat!("Sparse unique index over ", $kind, " handles"),
                SchemaChange::CreateIndex {
                    index: concat!("uq_", $kind, "_handle"),
                    table: $table,
                    unique: true,
                    definition: concat!(
                        "(",
                        $kind,
                        "_handle) WHERE ",
                        $kind,
                        "_handle IS NOT NULL"
                    ),
                },
            ),
            MigrationStep::new(
                concat!("index_", $kind, "_handle_folded"),
                concat!("Index ", $kind, " handles by their normalised form"),
                SchemaChange::CreateIndex {
                    index: concat!("idx_", $kind, "_handle_folded"),
                    table: $table,
                    unique: false,
                    definition: concat!("(lower(btrim(", $kind, "_handle, E' \\t\\n\\r')))"),
                },
            ),
        ]
    };
}

/// Topic column and the "required on new rows" check for a categorized kind.
macro_rules! topic_steps {
    ($kind:literal, $table:literal) => {
        [
            add_column!(
                concat!("add_", $kind, "_topic_handle"),
                $table,
                "topic_handle",
                "TEXT"
            ),
            MigrationStep::new(
                concat!("check_", $kind, "_topic_required"),
                concat!("Require a topic on new ", $kind, " rows"),
                SchemaChange::AddConstraint {
                    table: $table,
                    constraint: concat!("ck_", $kind, "_topic_required"),
                    definition: "CHECK (topic_handle IS NOT NULL) NOT VALID",
                },
            )
            .requires(&[concat!("add_", $kind, "_topic_handle")]),
        ]
    };
}

/// Category link table for a categorized kind.
macro_rules! category_link_steps {
    ($kind:literal, $table:literal, $link_table:literal) => {
        [
            MigrationStep::new(
                concat!("create_", $link_table),
                concat!("Create ", $kind, " category links"),
                SchemaChange::CreateTable {
                    table: $link_table,
                    definition: concat!(
                        $kind, "_discipline_id BIGSERIAL PRIMARY KEY, ",
                        $kind, "_id BIGINT NOT NULL REFERENCES ", $table, "(", $kind, "_id) ON DELETE CASCADE, ",
                        "discipline_id BIGINT NOT NULL REFERENCES tbl_discipline(discipline_id) ON DELETE CASCADE, ",
                        "is_primary BOOLEAN NOT NULL DEFAULT FALSE, ",
                        "created_at TIMESTAMPTZ NOT NULL DEFAULT now(), ",
                        "CONSTRAINT uq_", $kind, "_discipline UNIQUE (", $kind, "_id, discipline_id)"
                    ),
                },
            ),
            // Legacy link tables prefix their flag columns with the table name.
            MigrationStep::new(
                concat!("rename_", $kind, "_discipline_is_primary"),
                concat!("Rename ", $link_table, ".", $kind, "_discipline_is_primary to is_primary"),
                SchemaChange::RenameColumn {
                    table: $link_table,
                    from: concat!($kind, "_discipline_is_primary"),
                    to: "is_primary",
                },
            ),
            add_column!(
                concat!("add_", $kind, "_discipline_is_primary"),
                $link_table,
                "is_primary",
                "BOOLEAN NOT NULL DEFAULT FALSE"
            ),
            MigrationStep::new(
                concat!("rename_", $kind, "_discipline_rank"),
                concat!("Rename ", $link_table, ".", $kind, "_discipline_rank to rank"),
                SchemaChange::RenameColumn {
                    table: $link_table,
                    from: concat!($kind, "_discipline_rank"),
                    to: "rank",
                },
            ),
            MigrationStep::new(
                concat!("unique_", $kind, "_discipline_pair"),
                "One link per subject and discipline",
                SchemaChange::AddConstraint {
                    table: $link_table,
                    constraint: concat!("uq_", $kind, "_discipline"),
                    definition: concat!("UNIQUE (", $kind, "_id, discipline_id)"),
                },
            ),
            add_column!(concat!("add_", $kind, "_discipline_rank"), $link_table, "rank", "INTEGER"),
            add_column!(concat!("add_", $kind, "_discipline_notes"), $link_table, "notes", "TEXT"),
            MigrationStep::new(
                concat!("index_", $kind, "_discipline_by_discipline"),
                "Look up category links by discipline",
                SchemaChange::CreateIndex {
                    index: concat!("idx_", $kind, "_discipline_discipline"),
                    table: $link_table,
                    unique: false,
                    definition: "(discipline_id)",
                },
            ),
        ]
    };
}

/// Enrollment-scoped course link table.
macro_rules! course_link_steps {
    ($kind:literal, $table:literal, $link_table:literal) => {
        MigrationStep::new(
            concat!("create_", $link_table),
            concat!("Create enrollment-scoped course links for ", $kind, " rows"),
            SchemaChange::CreateTable {
                table: $link_table,
                definition: concat!(
                    "user_id BIGINT NOT NULL, ",
                    "course_id BIGINT NOT NULL, ",
                    $kind, "_id BIGINT NOT NULL REFERENCES ", $table, "(", $kind, "_id) ON DELETE CASCADE, ",
                    "segment_type TEXT CHECK (segment_type IN ('chapter', 'module', 'examination')), ",
                    "segment_label TEXT, ",
                    "created_at TIMESTAMPTZ NOT NULL DEFAULT now(), ",
                    "PRIMARY KEY (user_id, course_id, ", $kind, "_id), ",
                    "CONSTRAINT fk_user_course_", $kind, "_enrollment FOREIGN KEY (user_id, course_id) ",
                    "REFERENCES tbl_user_course(user_id, course_id) ON DELETE CASCADE"
                ),
            },
        )
        .requires(&["create_tbl_user_course"])
    };
}

/// Steps that only add structure; safe on a database full of legacy rows.
pub fn additive_plan() -> MigrationPlan {
    let mut steps = vec![
        // Legacy names from before the tbl_ prefix convention.
        MigrationStep::new(
            "rename_formula_table",
            "Rename formula to tbl_formula",
            SchemaChange::RenameTable {
                from: "formula",
                to: "tbl_formula",
            },
        ),
        MigrationStep::new(
            "rename_formula_id",
            "Rename tbl_formula.id to formula_id",
            SchemaChange::RenameColumn {
                table: "tbl_formula",
                from: "id",
                to: "formula_id",
            },
        ),
        MigrationStep::new(
            "rename_discipline_table",
            "Rename tbl_disciplines to tbl_discipline",
            SchemaChange::RenameTable {
                from: "tbl_disciplines",
                to: "tbl_discipline",
            },
        ),
        MigrationStep::new(
            "rename_formula_discipline_table",
            "Rename tbl_formula_disciplines to tbl_formula_discipline",
            SchemaChange::RenameTable {
                from: "tbl_formula_disciplines",
                to: "tbl_formula_discipline",
            },
        ),
        // Entity tables.
        MigrationStep::new(
            "create_tbl_discipline",
            "Create disciplines",
            SchemaChange::CreateTable {
                table: "tbl_discipline",
                definition: "discipline_id BIGSERIAL PRIMARY KEY, \
                             discipline_name TEXT NOT NULL, \
                             created_at TIMESTAMPTZ NOT NULL DEFAULT now()",
            },
        ),
        add_column!(
            "add_discipline_description",
            "tbl_discipline",
            "discipline_description",
            "TEXT"
        ),
        MigrationStep::new(
            "rename_discipline_parent",
            "Rename tbl_discipline.discipline_parent_id to parent_discipline_id",
            SchemaChange::RenameColumn {
                table: "tbl_discipline",
                from: "discipline_parent_id",
                to: "parent_discipline_id",
            },
        ),
        add_column!(
            "add_discipline_parent",
            "tbl_discipline",
            "parent_discipline_id",
            "BIGINT REFERENCES tbl_discipline(discipline_id) ON DELETE SET NULL"
        ),
        MigrationStep::new(
            "create_tbl_topic",
            "Create topics",
            SchemaChange::CreateTable {
                table: "tbl_topic",
                definition: "topic_id BIGSERIAL PRIMARY KEY, \
                             topic_name TEXT NOT NULL, \
                             topic_description TEXT, \
                             created_at TIMESTAMPTZ NOT NULL DEFAULT now()",
            },
        ),
        MigrationStep::new(
            "create_tbl_formula",
            "Create formulas",
            SchemaChange::CreateTable {
                table: "tbl_formula",
                definition: "formula_id BIGSERIAL PRIMARY KEY, \
                             formula_name TEXT NOT NULL, \
                             latex TEXT NOT NULL, \
                             display_order INTEGER, \
                             formula_description TEXT, \
                             english_verbalization TEXT, \
                             created_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
                             updated_at TIMESTAMPTZ NOT NULL DEFAULT now()",
            },
        ),
        MigrationStep::new(
            "widen_formula_id",
            "Widen formula_id to BIGINT on renamed legacy tables",
            SchemaChange::Statement {
                sql: "ALTER TABLE tbl_formula ALTER COLUMN formula_id TYPE BIGINT",
                guard: Guard::ColumnPresent {
                    table: "tbl_formula",
                    column: "formula_id",
                },
            },
        )
        .requires(&["rename_formula_id", "create_tbl_formula"]),
        add_column!(
            "add_formula_symbolic_verbalization",
            "tbl_formula",
            "symbolic_verbalization",
            "TEXT"
        ),
        add_column!("add_formula_units", "tbl_formula", "units", "TEXT"),
        add_column!("add_formula_example", "tbl_formula", "example", "TEXT"),
        add_column!(
            "add_formula_historical_context",
            "tbl_formula",
            "historical_context",
            "TEXT"
        ),
        MigrationStep::new(
            "create_tbl_term",
            "Create terms",
            SchemaChange::CreateTable {
                table: "tbl_term",
                definition: "term_id BIGSERIAL PRIMARY KEY, \
                             term_name TEXT NOT NULL, \
                             definition TEXT NOT NULL, \
                             display_order INTEGER, \
                             created_at TIMESTAMPTZ NOT NULL DEFAULT now()",
            },
        ),
        add_column!(
            "add_term_formulaic_expression",
            "tbl_term",
            "formulaic_expression",
            "TEXT"
        ),
        MigrationStep::new(
            "create_tbl_question",
            "Create questions",
            SchemaChange::CreateTable {
                table: "tbl_question",
                definition: "question_id BIGSERIAL PRIMARY KEY, \
                             question_type TEXT NOT NULL CHECK (question_type IN \
                             ('multiple_choice', 'true_false', 'word_problem', 'multipart')), \
                             stem TEXT NOT NULL, \
                             explanation TEXT, \
                             display_order INTEGER, \
                             created_at TIMESTAMPTZ NOT NULL DEFAULT now()",
            },
        ),
        add_column!(
            "add_question_part_label",
            "tbl_question",
            "part_label",
            "TEXT"
        ),
        MigrationStep::new(
            "create_tbl_course",
            "Create courses",
            SchemaChange::CreateTable {
                table: "tbl_course",
                definition: "course_id BIGSERIAL PRIMARY KEY, \
                             course_name TEXT NOT NULL, \
                             course_code TEXT, \
                             course_description TEXT, \
                             created_at TIMESTAMPTZ NOT NULL DEFAULT now()",
            },
        ),
        MigrationStep::new(
            "create_tbl_constant",
            "Create physical constants",
            SchemaChange::CreateTable {
                table: "tbl_constant",
                definition: "constant_id BIGSERIAL PRIMARY KEY, \
                             constant_name TEXT NOT NULL, \
                             symbol TEXT, \
                             value_text TEXT, \
                             description TEXT, \
                             display_order INTEGER",
            },
        ),
        MigrationStep::new(
            "create_tbl_unit",
            "Create units",
            SchemaChange::CreateTable {
                table: "tbl_unit",
                definition: "unit_id BIGSERIAL PRIMARY KEY, \
                             unit_name TEXT NOT NULL, \
                             symbol TEXT, \
                             unit_system TEXT, \
                             description TEXT, \
                             display_order INTEGER",
            },
        ),
    ];

    // Links.
    steps.extend(category_link_steps!(
        "formula",
        "tbl_formula",
        "tbl_formula_discipline"
    ));
    steps.extend(category_link_steps!("term", "tbl_term", "tbl_term_discipline"));
    steps.extend([
        MigrationStep::new(
            "create_tbl_formula_question",
            "Link questions to formulas",
            SchemaChange::CreateTable {
                table: "tbl_formula_question",
                definition: "formula_id BIGINT NOT NULL REFERENCES tbl_formula(formula_id) ON DELETE CASCADE, \
                             question_id BIGINT NOT NULL REFERENCES tbl_question(question_id) ON DELETE CASCADE, \
                             PRIMARY KEY (formula_id, question_id)",
            },
        ),
        MigrationStep::new(
            "create_tbl_term_question",
            "Link questions to terms",
            SchemaChange::CreateTable {
                table: "tbl_term_question",
                definition: "term_id BIGINT NOT NULL REFERENCES tbl_term(term_id) ON DELETE CASCADE, \
                             question_id BIGINT NOT NULL REFERENCES tbl_question(question_id) ON DELETE CASCADE, \
                             PRIMARY KEY (term_id, question_id)",
            },
        ),
        MigrationStep::new(
            "create_tbl_formula_prerequisite",
            "Formula prerequisites",
            SchemaChange::CreateTable {
                table: "tbl_formula_prerequisite",
                definition: "formula_id BIGINT NOT NULL REFERENCES tbl_formula(formula_id) ON DELETE CASCADE, \
                             prerequisite_formula_id BIGINT NOT NULL REFERENCES tbl_formula(formula_id) ON DELETE CASCADE, \
                             PRIMARY KEY (formula_id, prerequisite_formula_id), \
                             CHECK (formula_id <> prerequisite_formula_id)",
            },
        ),
        MigrationStep::new(
            "create_tbl_user_course",
            "Course enrollments",
            SchemaChange::CreateTable {
                table: "tbl_user_course",
                definition: "user_id BIGINT NOT NULL, \
                             course_id BIGINT NOT NULL REFERENCES tbl_course(course_id) ON DELETE CASCADE, \
                             enrolled_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
                             PRIMARY KEY (user_id, course_id)",
            },
        ),
        course_link_steps!("formula", "tbl_formula", "tbl_user_course_formula"),
        course_link_steps!("term", "tbl_term", "tbl_user_course_term"),
    ]);

    // Handles.
    steps.extend(handle_steps!("discipline", "tbl_discipline"));
    steps.extend(handle_steps!("topic", "tbl_topic"));
    steps.extend(handle_steps!("formula", "tbl_formula"));
    steps.extend(handle_steps!("term", "tbl_term"));
    steps.extend(handle_steps!("question", "tbl_question"));
    steps.extend(handle_steps!("course", "tbl_course"));
    steps.extend(handle_steps!("constant", "tbl_constant"));
    steps.extend(handle_steps!("unit", "tbl_unit"));

    // Topics.
    steps.extend(topic_steps!("formula", "tbl_formula"));
    steps.extend(topic_steps!("term", "tbl_term"));
    steps.push(
        MigrationStep::new(
            "seed_uncategorized_topic",
            "Ensure the fallback topic exists",
            SchemaChange::Statement {
                sql: "INSERT INTO tbl_topic (topic_handle, topic_name) \
                      VALUES ('uncategorized', 'Uncategorized') \
                      ON CONFLICT (topic_handle) WHERE topic_handle IS NOT NULL DO NOTHING",
                guard: Guard::Always,
            },
        )
        .requires(&["index_topic_handle"]),
    );

    MigrationPlan::new(ADDITIVE_PLAN, steps)
}

/// Steps that enforce what the backfills established.
pub fn tightening_plan() -> MigrationPlan {
    MigrationPlan::new(
        TIGHTENING_PLAN,
        vec![
            MigrationStep::new(
                "validate_formula_topic_required",
                "Every formula has a topic",
                SchemaChange::ValidateConstraint {
                    table: "tbl_formula",
                    constraint: "ck_formula_topic_required",
                },
            )
            .requires(&["check_formula_topic_required"]),
            MigrationStep::new(
                "validate_term_topic_required",
                "Every term has a topic",
                SchemaChange::ValidateConstraint {
                    table: "tbl_term",
                    constraint: "ck_term_topic_required",
                },
            )
            .requires(&["check_term_topic_required"]),
            MigrationStep::new(
                "unique_formula_primary",
                "At most one primary discipline per formula",
                SchemaChange::CreateIndex {
                    index: "uq_formula_discipline_primary",
                    table: "tbl_formula_discipline",
                    unique: true,
                    definition: "(formula_id) WHERE is_primary",
                },
            )
            .requires(&["create_tbl_formula_discipline"]),
            MigrationStep::new(
                "unique_term_primary",
                "At most one primary discipline per term",
                SchemaChange::CreateIndex {
                    index: "uq_term_discipline_primary",
                    table: "tbl_term_discipline",
                    unique: true,
                    definition: "(term_id) WHERE is_primary",
                },
            )
            .requires(&["create_tbl_term_discipline"]),
        ],
    )
}

/// Both plans in run order.
pub fn all_plans() -> Vec<MigrationPlan> {
    vec![additive_plan(), tightening_plan()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use formulary_core::EntityKind;

    #[test]
    fn test_plans_validate_in_order() {
        let additive = additive_plan();
        additive.validate(&[]).unwrap();
        tightening_plan()
            .validate(&additive.step_names())
            .unwrap();
    }

    #[test]
    fn test_tightening_cannot_run_alone() {
        assert!(tightening_plan().validate(&[]).is_err());
    }

    #[test]
    fn test_every_kind_gets_a_sparse_handle_index() {
        let plan = additive_plan();
        for kind in EntityKind::ALL {
            let step = plan
                .steps
                .iter()
                .find(|s| {
                    matches!(s.change, SchemaChange::CreateIndex { index, .. } if index == kind.handle_index())
                })
                .unwrap_or_else(|| panic!("no handle index for {}", kind));
            let sql = step.change.to_sql();
            assert!(sql.starts_with("CREATE UNIQUE INDEX"), "{}", sql);
            assert!(sql.ends_with(&format!("WHERE {} IS NOT NULL", kind.handle_column())));
        }
    }

    #[test]
    fn test_course_links_reference_the_enrollment() {
        let plan = additive_plan();
        let step = plan
            .steps
            .iter()
            .find(|s| s.name == "create_tbl_user_course_term")
            .unwrap();
        let sql = step.change.to_sql();
        assert!(sql.contains("FOREIGN KEY (user_id, course_id) REFERENCES tbl_user_course"));
    }

    #[test]
    fn test_renames_precede_creates() {
        let names = additive_plan().step_names();
        let pos = |n: &str| names.iter().position(|s| *s == n).unwrap();
        assert!(pos("rename_formula_table") < pos("create_tbl_formula"));
        assert!(pos("rename_discipline_table") < pos("create_tbl_discipline"));
    }

    #[test]
    fn test_legacy_link_columns_renamed_before_use() {
        let names = additive_plan().step_names();
        let pos = |n: &str| names.iter().position(|s| *s == n).unwrap();
        assert!(pos("rename_discipline_table") < pos("rename_discipline_parent"));
        assert!(pos("rename_discipline_parent") < pos("add_discipline_parent"));
        for kind in ["formula", "term"] {
            let step = |prefix: &str, suffix: &str| pos(&format!("{}_{}_{}", prefix, kind, suffix));
            assert!(step("create_tbl", "discipline") < step("rename", "discipline_is_primary"));
            assert!(step("rename", "discipline_is_primary") < step("add", "discipline_is_primary"));
            assert!(step("rename", "discipline_rank") < step("add", "discipline_rank"));
        }

        let plan = additive_plan();
        let rename = plan
            .steps
            .iter()
            .find(|s| s.name == "rename_term_discipline_is_primary")
            .unwrap();
        assert_eq!(
            rename.change.to_sql(),
            "ALTER TABLE tbl_term_discipline RENAME COLUMN term_discipline_is_primary TO is_primary"
        );
        assert!(matches!(
            rename.change.guard(),
            Guard::ColumnRenamable { to: "is_primary", .. }
        ));
    }

    #[test]
    fn test_no_destructive_steps() {
        for plan in all_plans() {
            assert!(plan.steps.iter().all(|s| !s.change.is_destructive()));
        }
    }
}
