use anyhow::Result;
use serde_json::json;

use stella_selfmod::{FeatureUpdate, NewFeature, Runtime};

use super::print_json;
use crate::cli::FeatureCommand;

pub async fn run_feature(runtime: &Runtime, command: FeatureCommand) -> Result<()> {
    let selfmod = &runtime.selfmod;

    match command {
        FeatureCommand::Create {
            id,
            name,
            description,
            conversation,
        } => {
            let meta = selfmod
                .create_feature(NewFeature {
                    id: id.clone(),
                    name: name.unwrap_or_default(),
                    description,
                    conversation_id: conversation.clone(),
                })
                .await?;
            if let Some(conversation) = conversation {
                selfmod.set_active_feature(&conversation, &id).await?;
            }
            print_json(&meta)
        }
        FeatureCommand::Show { id } => match selfmod.get_feature(&id).await? {
            Some(meta) => print_json(&meta),
            None => anyhow::bail!("Feature not found: {}", id),
        },
        FeatureCommand::List => print_json(&selfmod.list_features().await?),
        FeatureCommand::Update {
            id,
            name,
            description,
            status,
        } => {
            let meta = selfmod
                .update_feature(
                    &id,
                    FeatureUpdate {
                        name,
                        description,
                        status: status.map(Into::into),
                    },
                )
                .await?;
            print_json(&meta)
        }
        FeatureCommand::Activate {
            conversation,
            feature,
        } => {
            selfmod.set_active_feature(&conversation, &feature).await?;
            print_json(&json!({ "conversationId": conversation, "featureId": feature }))
        }
        FeatureCommand::Active {
            conversation,
            clear,
        } => {
            if clear {
                selfmod.clear_active_feature(&conversation).await?;
            }
            let feature = selfmod.get_active_feature(&conversation).await;
            print_json(&json!({ "conversationId": conversation, "featureId": feature }))
        }
    }
}
